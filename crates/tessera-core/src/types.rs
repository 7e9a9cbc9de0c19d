//! Addressing types used throughout Tessera
//!
//! Every participant is named by a [`Jid`]: `user[:device]@server`. The server
//! decides the addressing namespace. Phone-number identities and linked
//! (privacy preserving) identities can both name the same person, each with
//! a hosted variant.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Server of phone-number identities
pub const PN_SERVER: &str = "s.whatsapp.net";
/// Legacy alias of the phone-number server
pub const LEGACY_PN_SERVER: &str = "c.us";
/// Server of linked identities
pub const LID_SERVER: &str = "lid";
/// Server of hosted phone-number identities
pub const HOSTED_PN_SERVER: &str = "hosted";
/// Server of hosted linked identities
pub const HOSTED_LID_SERVER: &str = "hosted.lid";
/// Server of groups
pub const GROUP_SERVER: &str = "g.us";
/// Server of broadcast lists
pub const BROADCAST_SERVER: &str = "broadcast";
/// Server of channels
pub const NEWSLETTER_SERVER: &str = "newsletter";

/// User part of the status broadcast address
pub const STATUS_BROADCAST_USER: &str = "status";

/// Device index reserved for hosted devices
pub const HOSTED_DEVICE: u16 = 99;

/// Addressing namespace of a [`Jid`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Server {
    /// Phone-number identity
    Pn,
    /// Linked identity
    Lid,
    /// Hosted phone-number identity
    HostedPn,
    /// Hosted linked identity
    HostedLid,
    /// Group chat
    Group,
    /// Broadcast list (including status)
    Broadcast,
    /// Channel
    Newsletter,
}

impl Server {
    /// Wire name of the server
    pub fn as_str(&self) -> &'static str {
        match self {
            Server::Pn => PN_SERVER,
            Server::Lid => LID_SERVER,
            Server::HostedPn => HOSTED_PN_SERVER,
            Server::HostedLid => HOSTED_LID_SERVER,
            Server::Group => GROUP_SERVER,
            Server::Broadcast => BROADCAST_SERVER,
            Server::Newsletter => NEWSLETTER_SERVER,
        }
    }

    /// Domain number used when deriving signal addresses
    pub fn domain_type(&self) -> u32 {
        match self {
            Server::Lid => 1,
            Server::HostedPn => 128,
            Server::HostedLid => 129,
            _ => 0,
        }
    }
}

impl FromStr for Server {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            PN_SERVER | LEGACY_PN_SERVER => Ok(Server::Pn),
            LID_SERVER => Ok(Server::Lid),
            HOSTED_PN_SERVER => Ok(Server::HostedPn),
            HOSTED_LID_SERVER => Ok(Server::HostedLid),
            GROUP_SERVER => Ok(Server::Group),
            BROADCAST_SERVER => Ok(Server::Broadcast),
            NEWSLETTER_SERVER => Ok(Server::Newsletter),
            other => Err(Error::InvalidJid(format!("unknown server '{}'", other))),
        }
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user or device address
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Jid {
    /// User part
    pub user: String,
    /// Device index, absent for user-level addresses
    pub device: Option<u16>,
    /// Addressing namespace
    pub server: Server,
}

impl Jid {
    /// User-level address
    pub fn new(user: impl Into<String>, server: Server) -> Self {
        Self {
            user: user.into(),
            device: None,
            server,
        }
    }

    /// Device-level address
    pub fn device(user: impl Into<String>, device: u16, server: Server) -> Self {
        Self {
            user: user.into(),
            device: Some(device),
            server,
        }
    }

    /// Phone-number identity
    pub fn pn(user: impl Into<String>) -> Self {
        Self::new(user, Server::Pn)
    }

    /// Linked identity
    pub fn lid(user: impl Into<String>) -> Self {
        Self::new(user, Server::Lid)
    }

    /// Group address
    pub fn group(id: impl Into<String>) -> Self {
        Self::new(id, Server::Group)
    }

    /// The status broadcast address
    pub fn status_broadcast() -> Self {
        Self::new(STATUS_BROADCAST_USER, Server::Broadcast)
    }

    /// The server itself, used as the target of queries
    pub fn server_jid() -> Self {
        Self::new("", Server::Pn)
    }

    /// Same address with the given device
    pub fn with_device(&self, device: u16) -> Self {
        Self {
            user: self.user.clone(),
            device: Some(device),
            server: self.server,
        }
    }

    /// User-level form of this address (device dropped)
    pub fn to_user_jid(&self) -> Self {
        Self::new(self.user.clone(), self.server)
    }

    /// Device index, treating a user-level address as device 0
    pub fn device_or_zero(&self) -> u16 {
        self.device.unwrap_or(0)
    }

    /// Phone-number identity
    pub fn is_pn(&self) -> bool {
        self.server == Server::Pn
    }

    /// Linked identity
    pub fn is_lid(&self) -> bool {
        self.server == Server::Lid
    }

    /// Hosted phone-number identity
    pub fn is_hosted_pn(&self) -> bool {
        self.server == Server::HostedPn
    }

    /// Hosted linked identity
    pub fn is_hosted_lid(&self) -> bool {
        self.server == Server::HostedLid
    }

    /// Phone-number class, hosted or not
    pub fn is_pn_class(&self) -> bool {
        matches!(self.server, Server::Pn | Server::HostedPn)
    }

    /// Linked class, hosted or not
    pub fn is_lid_class(&self) -> bool {
        matches!(self.server, Server::Lid | Server::HostedLid)
    }

    /// Either hosted server
    pub fn is_hosted(&self) -> bool {
        matches!(self.server, Server::HostedPn | Server::HostedLid)
    }

    /// Group chat
    pub fn is_group(&self) -> bool {
        self.server == Server::Group
    }

    /// The status broadcast address
    pub fn is_status_broadcast(&self) -> bool {
        self.server == Server::Broadcast && self.user == STATUS_BROADCAST_USER
    }

    /// Channel
    pub fn is_newsletter(&self) -> bool {
        self.server == Server::Newsletter
    }

    /// Both addresses name the same user part
    pub fn is_same_user(&self, other: &Jid) -> bool {
        self.user == other.user
    }

    /// Both addresses name the same device in the same namespace.
    ///
    /// A user-level address is the same device as device 0.
    pub fn is_same_device(&self, other: &Jid) -> bool {
        self.user == other.user
            && self.server == other.server
            && self.device_or_zero() == other.device_or_zero()
    }

    /// Address of the ratchet session for this device
    pub fn signal_address(&self) -> SignalAddress {
        let domain = self.server.domain_type();
        let name = if domain == 0 {
            self.user.clone()
        } else {
            format!("{}_{}", self.user, domain)
        };
        SignalAddress {
            name,
            device_id: u32::from(self.device_or_zero()),
        }
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.user.is_empty() {
            return f.write_str(self.server.as_str());
        }
        // Device 0 is the primary device and is encoded without a suffix
        match self.device {
            Some(device) if device != 0 => write!(f, "{}:{}@{}", self.user, device, self.server),
            _ => write!(f, "{}@{}", self.user, self.server),
        }
    }
}

impl FromStr for Jid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((user_part, server)) = s.rsplit_once('@') else {
            // Bare server address
            return Ok(Self::new("", s.parse()?));
        };
        let server: Server = server.parse()?;

        let (user, device) = match user_part.split_once(':') {
            Some((user, device)) => {
                let device = device
                    .parse::<u16>()
                    .map_err(|_| Error::InvalidJid(format!("bad device in '{}'", s)))?;
                (user, Some(device))
            }
            None => (user_part, None),
        };

        if user.is_empty() {
            return Err(Error::InvalidJid(format!("empty user in '{}'", s)));
        }

        Ok(Self {
            user: user.to_string(),
            device,
            server,
        })
    }
}

impl TryFrom<String> for Jid {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Jid> for String {
    fn from(jid: Jid) -> Self {
        jid.to_string()
    }
}

/// Address of one ratchet session (`name.device`)
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignalAddress {
    /// User name, suffixed with the domain for non phone-number servers
    pub name: String,
    /// Device index
    pub device_id: u32,
}

impl fmt::Display for SignalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.device_id)
    }
}

/// One device a message is fanned out to. Computed per relay call.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DeviceTarget {
    /// User part
    pub user: String,
    /// Device index
    pub device: u16,
    /// Fully resolved device address
    pub jid: Jid,
}

impl DeviceTarget {
    /// Build from a device-level address
    pub fn from_jid(jid: Jid) -> Self {
        Self {
            user: jid.user.clone(),
            device: jid.device_or_zero(),
            jid,
        }
    }
}

/// A phone-number identity and the linked identity of the same user
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LidPnPair {
    /// Linked identity
    pub lid: Jid,
    /// Phone-number identity
    pub pn: Jid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_jid() {
        let jid: Jid = "12345:7@s.whatsapp.net".parse().unwrap();
        assert_eq!(jid.user, "12345");
        assert_eq!(jid.device, Some(7));
        assert_eq!(jid.server, Server::Pn);
        assert_eq!(jid.to_string(), "12345:7@s.whatsapp.net");
    }

    #[test]
    fn test_parse_user_jid() {
        let jid: Jid = "abc@lid".parse().unwrap();
        assert_eq!(jid, Jid::lid("abc"));
        assert!(jid.is_lid_class());
        assert!(!jid.is_pn_class());
    }

    #[test]
    fn test_legacy_server_normalizes() {
        let jid: Jid = "555@c.us".parse().unwrap();
        assert_eq!(jid.server, Server::Pn);
    }

    #[test]
    fn test_bare_server() {
        let jid: Jid = "s.whatsapp.net".parse().unwrap();
        assert_eq!(jid, Jid::server_jid());
        assert_eq!(jid.to_string(), "s.whatsapp.net");
    }

    #[test]
    fn test_invalid_jids() {
        assert!("user@nowhere".parse::<Jid>().is_err());
        assert!("user:x@lid".parse::<Jid>().is_err());
        assert!("@lid".parse::<Jid>().is_err());
    }

    #[test]
    fn test_status_broadcast() {
        let jid: Jid = "status@broadcast".parse().unwrap();
        assert!(jid.is_status_broadcast());
        assert!(!Jid::new("list1", Server::Broadcast).is_status_broadcast());
    }

    #[test]
    fn test_same_device_treats_missing_device_as_zero() {
        let a = Jid::pn("1");
        let b = Jid::device("1", 0, Server::Pn);
        let c = Jid::device("1", 2, Server::Pn);
        assert!(a.is_same_device(&b));
        assert!(!a.is_same_device(&c));
        assert!(a.is_same_user(&c));
        assert!(!a.is_same_device(&Jid::lid("1")));
    }

    #[test]
    fn test_primary_device_has_no_suffix() {
        assert_eq!(Jid::device("1", 0, Server::Pn).to_string(), "1@s.whatsapp.net");
        assert_eq!(Jid::device("1", 4, Server::Lid).to_string(), "1:4@lid");
    }

    #[test]
    fn test_signal_address() {
        assert_eq!(Jid::device("1", 3, Server::Pn).signal_address().to_string(), "1.3");
        assert_eq!(Jid::lid("9").signal_address().to_string(), "9_1.0");
        assert_eq!(
            Jid::device("9", 99, Server::HostedLid).signal_address().to_string(),
            "9_129.99"
        );
    }

    #[test]
    fn test_serde_as_string() {
        let jid = Jid::device("42", 1, Server::Lid);
        let json = serde_json::to_string(&jid).unwrap();
        assert_eq!(json, "\"42:1@lid\"");
        let back: Jid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, jid);
    }
}
