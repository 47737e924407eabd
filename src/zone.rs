//! Zone IDs: canonical hierarchical names for every piece of shared
//! state in the workspace.
//!
//! A zone ID is a `/`-joined path of textual segments. The first segment
//! is a kind tag used for routing; later segments carry the address,
//! request token, connection number, and channel role.

use std::fmt;

use rand::Rng;

/// Kind tag for the per-address directory of pending connect requests.
pub const SERVER_LISTEN_BACKLOG: &str = "id_server_listen_backlog";
/// Kind tag for per-connection channel zones.
pub const CONNECTION: &str = "id_connection";

/// Request tokens carry this literal prefix so backlog listings can skip
/// unrelated files.
pub const REQUEST_TOKEN_PREFIX: &str = "req-";

/// One of the four channel zones that make up a full-duplex connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Channel {
    C2sCtrl,
    C2sData,
    S2cCtrl,
    S2cData,
}

impl Channel {
    /// The zone ID segment naming this channel.
    pub fn id_tag(self) -> &'static str {
        match self {
            Channel::C2sCtrl => "id_conn_c2s_ctrl",
            Channel::C2sData => "id_conn_c2s_data",
            Channel::S2cCtrl => "id_conn_s2c_ctrl",
            Channel::S2cData => "id_conn_s2c_data",
        }
    }

    pub fn from_id_tag(tag: &str) -> Option<Channel> {
        match tag {
            "id_conn_c2s_ctrl" => Some(Channel::C2sCtrl),
            "id_conn_c2s_data" => Some(Channel::C2sData),
            "id_conn_s2c_ctrl" => Some(Channel::S2cCtrl),
            "id_conn_s2c_data" => Some(Channel::S2cData),
            _ => None,
        }
    }

    /// The file this channel occupies inside a connection directory.
    pub fn file_name(self) -> &'static str {
        match self {
            Channel::C2sCtrl => "c2s_ctrl",
            Channel::C2sData => "c2s_data",
            Channel::S2cCtrl => "s2c_ctrl",
            Channel::S2cData => "s2c_data",
        }
    }

    /// Control channels are JSON records; data channels are opaque blobs.
    pub fn is_ctrl(self) -> bool {
        match self {
            Channel::C2sCtrl | Channel::S2cCtrl => true,
            Channel::C2sData | Channel::S2cData => false,
        }
    }
}

/// A slash-joined zone name.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct ZoneId(String);

impl ZoneId {
    /// Joins segments into a zone ID.
    ///
    /// # Panics
    /// Panics if a segment contains `/`; segments must be atomic.
    pub fn join<I>(parts: I) -> ZoneId
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut id = String::new();
        for part in parts {
            let part = part.as_ref();
            assert!(!part.contains('/'), "zone segment contains '/': {}", part);
            if !id.is_empty() {
                id.push('/');
            }
            id.push_str(part);
        }
        ZoneId(id)
    }

    /// The listen backlog aggregate for `address`.
    pub fn backlog(address: &str) -> ZoneId {
        ZoneId::join(&[SERVER_LISTEN_BACKLOG, address])
    }

    /// One pending connect request under `address`.
    pub fn request(address: &str, token: &str) -> ZoneId {
        ZoneId::join(&[SERVER_LISTEN_BACKLOG, address, token])
    }

    /// The connection zone for `conn_num` under `address`. Channel zones
    /// hang off of it via [`ZoneId::channel`].
    pub fn connection(address: &str, conn_num: u32) -> ZoneId {
        let num = conn_num.to_string();
        ZoneId::join(&[CONNECTION, address, num.as_str()])
    }

    /// One of the four channel zones under a connection zone.
    pub fn channel(&self, channel: Channel) -> ZoneId {
        ZoneId(format!("{}/{}", self.0, channel.id_tag()))
    }

    /// The first segment, used for routing to a backing layout.
    pub fn head(&self) -> &str {
        self.split()[0]
    }

    pub fn split(&self) -> Vec<&str> {
        self.0.split('/').collect()
    }

    pub fn segments(&self) -> usize {
        self.split().len()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Mints a fresh request token: `req-` plus 32 random hex digits.
pub fn make_request_token<R: Rng>(rng: &mut R) -> String {
    format!(
        "{}{:016x}{:016x}",
        REQUEST_TOKEN_PREFIX,
        rng.gen::<u64>(),
        rng.gen::<u64>()
    )
}

/// Whether `raw` names a pending connect request.
pub fn is_request_token(raw: &str) -> bool {
    raw.starts_with(REQUEST_TOKEN_PREFIX)
}
