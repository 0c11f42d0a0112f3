//! # Access Control
//!
//! Two layers of permission live here:
//!
//! 1. The per-connection [`Acl`], a set of booleans per resource kind computed
//!    once at authentication time by the backend. It gates whole commands.
//! 2. The resource ACL carried by individual objects: an owner, an owner group
//!    and a bitmask with three tiers (owner `<< 8`, group `<< 4`, everyone).
//!    [`allowed`] resolves a single operation against it.
//!
//! The bit layout is shared with persisted objects and must not change.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SUPER_USER: &str = "system.user.admin";
pub const ADMIN_GROUP: &str = "system.group.administrator";
pub const USER_PREFIX: &str = "system.user.";
pub const GROUP_PREFIX: &str = "system.group.";

pub const ACCESS_EXECUTE: u32 = 0x1;
pub const ACCESS_WRITE: u32 = 0x2;
pub const ACCESS_READ: u32 = 0x4;

const OWNER_SHIFT: u32 = 8;
const GROUP_SHIFT: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Object,
    State,
    File,
    Users,
    Other,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Object => "object",
            ResourceKind::State => "state",
            ResourceKind::File => "file",
            ResourceKind::Users => "users",
            ResourceKind::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    List,
    Read,
    Write,
    Create,
    Delete,
    Execute,
    Http,
    #[serde(rename = "sendto")]
    SendTo,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::List => "list",
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Create => "create",
            Operation::Delete => "delete",
            Operation::Execute => "execute",
            Operation::Http => "http",
            Operation::SendTo => "sendto",
        }
    }
}

/// The flag tested against a resource ACL bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessFlag {
    /// Listing never consults the resource ACL.
    List,
    Read,
    Write,
    Execute,
}

impl AccessFlag {
    pub fn bits(&self) -> u32 {
        match self {
            AccessFlag::List => 0,
            AccessFlag::Read => ACCESS_READ,
            AccessFlag::Write => ACCESS_WRITE,
            AccessFlag::Execute => ACCESS_EXECUTE,
        }
    }
}

impl From<Operation> for AccessFlag {
    fn from(op: Operation) -> Self {
        match op {
            Operation::List => AccessFlag::List,
            Operation::Read => AccessFlag::Read,
            Operation::Write | Operation::Create | Operation::Delete => AccessFlag::Write,
            Operation::Execute | Operation::Http | Operation::SendTo => AccessFlag::Execute,
        }
    }
}

/// Optional booleans used to narrow a [`PermissionSet`]. `None` leaves a bit alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionMask {
    pub list: Option<bool>,
    pub read: Option<bool>,
    pub write: Option<bool>,
    pub create: Option<bool>,
    pub delete: Option<bool>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtherMask {
    pub execute: Option<bool>,
    pub http: Option<bool>,
    pub sendto: Option<bool>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionSet {
    pub list: bool,
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub delete: bool,
}

impl PermissionSet {
    pub const fn full() -> Self {
        Self {
            list: true,
            read: true,
            write: true,
            create: true,
            delete: true,
        }
    }

    pub const fn read_only() -> Self {
        Self {
            list: true,
            read: true,
            write: false,
            create: false,
            delete: false,
        }
    }

    pub fn get(&self, op: Operation) -> bool {
        match op {
            Operation::List => self.list,
            Operation::Read => self.read,
            Operation::Write => self.write,
            Operation::Create => self.create,
            Operation::Delete => self.delete,
            Operation::Execute | Operation::Http | Operation::SendTo => false,
        }
    }

    /// ANDs every masked bit in. Never sets a bit that was clear.
    pub fn narrow(&mut self, mask: &PermissionMask) {
        fn and(bit: &mut bool, m: Option<bool>) {
            if let Some(allowed) = m {
                *bit = *bit && allowed;
            }
        }
        and(&mut self.list, mask.list);
        and(&mut self.read, mask.read);
        and(&mut self.write, mask.write);
        and(&mut self.create, mask.create);
        and(&mut self.delete, mask.delete);
    }

    pub fn union(&mut self, other: &PermissionSet) {
        self.list |= other.list;
        self.read |= other.read;
        self.write |= other.write;
        self.create |= other.create;
        self.delete |= other.delete;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtherPermissions {
    pub execute: bool,
    pub http: bool,
    pub sendto: bool,
}

impl OtherPermissions {
    pub const fn full() -> Self {
        Self {
            execute: true,
            http: true,
            sendto: true,
        }
    }

    pub fn get(&self, op: Operation) -> bool {
        match op {
            Operation::Execute => self.execute,
            Operation::Http => self.http,
            Operation::SendTo => self.sendto,
            _ => false,
        }
    }

    pub fn narrow(&mut self, mask: &OtherMask) {
        if let Some(allowed) = mask.execute {
            self.execute = self.execute && allowed;
        }
        if let Some(allowed) = mask.http {
            self.http = self.http && allowed;
        }
        if let Some(allowed) = mask.sendto {
            self.sendto = self.sendto && allowed;
        }
    }

    pub fn union(&mut self, other: &OtherPermissions) {
        self.execute |= other.execute;
        self.http |= other.http;
        self.sendto |= other.sendto;
    }
}

/// The resolved permissions of one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Acl {
    pub user: String,
    pub groups: Vec<String>,
    pub object: PermissionSet,
    pub state: PermissionSet,
    pub file: PermissionSet,
    pub users: PermissionSet,
    pub other: OtherPermissions,
}

impl Acl {
    /// Everything allowed. What the super user gets.
    pub fn full(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            groups: Vec::new(),
            object: PermissionSet::full(),
            state: PermissionSet::full(),
            file: PermissionSet::full(),
            users: PermissionSet::full(),
            other: OtherPermissions::full(),
        }
    }

    /// Nothing allowed. What an unauthenticated connection holds.
    pub fn none(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            ..Default::default()
        }
    }

    pub fn allows(&self, kind: ResourceKind, op: Operation) -> bool {
        match kind {
            ResourceKind::Object => self.object.get(op),
            ResourceKind::State => self.state.get(op),
            ResourceKind::File => self.file.get(op),
            ResourceKind::Users => self.users.get(op),
            ResourceKind::Other => self.other.get(op),
        }
    }

    pub fn is_super_user(&self) -> bool {
        self.user == SUPER_USER || self.groups.iter().any(|g| g == ADMIN_GROUP)
    }

    /// The user name without the `system.user.` prefix.
    pub fn short_user(&self) -> &str {
        self.user.strip_prefix(USER_PREFIX).unwrap_or(&self.user)
    }
}

/// Resolves one operation against a resource ACL.
///
/// `acl_bits` is `None` when the resource carries no ACL metadata, in which case
/// access is granted, as it is for [`AccessFlag::List`]. The super user and
/// members of the administrator group bypass the check. Otherwise exactly one
/// tier decides: the owner tier when the requester owns the resource, else the
/// group tier when the requester is in the owner group, else the everyone tier.
pub fn allowed(
    acl_bits: Option<u32>,
    owner: &str,
    owner_group: &str,
    requester: &str,
    requester_groups: &[String],
    flag: AccessFlag,
) -> bool {
    let bits = match acl_bits {
        Some(bits) => bits,
        None => return true,
    };
    if flag == AccessFlag::List {
        return true;
    }
    if requester == SUPER_USER || requester_groups.iter().any(|g| g == ADMIN_GROUP) {
        return true;
    }

    let shift = if requester == owner {
        OWNER_SHIFT
    } else if requester_groups.iter().any(|g| g == owner_group) {
        GROUP_SHIFT
    } else {
        0
    };
    bits & (flag.bits() << shift) != 0
}

/// The `acl` block of a stored object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceAcl {
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub owner_group: String,
    pub object: Option<u32>,
    pub state: Option<u32>,
    pub file: Option<u32>,
}

impl ResourceAcl {
    pub fn bits_for(&self, kind: ResourceKind) -> Option<u32> {
        match kind {
            ResourceKind::State => self.state,
            ResourceKind::File => self.file,
            _ => self.object,
        }
    }
}

/// Checks an object document (`{ common, acl, ... }`) for the requester.
///
/// Objects without `common` or without `acl` are treated as unprotected.
pub fn check_object(obj: &Value, requester: &Acl, kind: ResourceKind, flag: AccessFlag) -> bool {
    if obj.get("common").is_none() {
        return true;
    }
    let resource_acl = match obj.get("acl") {
        Some(raw) => match serde_json::from_value::<ResourceAcl>(raw.clone()) {
            Ok(parsed) => parsed,
            Err(_) => return true,
        },
        None => return true,
    };
    allowed(
        resource_acl.bits_for(kind),
        &resource_acl.owner,
        &resource_acl.owner_group,
        &requester.user,
        &requester.groups,
        flag,
    )
}
