//! Typed views of the JSON records stored in control and backlog zones.
//!
//! Every record kind carries a fixed set of keys on the wire; fields are
//! optional so that an empty `{}` record reads as the idle state. A JSON
//! object that parses but does not match the expected shape is treated
//! by callers the same way as a partial write: poll again.

use serde_json;

/// Sequence fields hold this value while a channel is idle.
pub const IDLE_SEQ: i64 = -1;

/// Stage of the request/reply cycle on a send-control zone, named by the
/// `(F_SND, F_SND_ACK)` pair.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SndStage {
    /// No payload outstanding.
    Idle,
    /// Sender has staged a payload and awaits the receiver's ack.
    Requesting,
    /// Receiver has consumed the payload; sender clears next.
    Replying,
}

/// Stage of the half-close cycle, named by `(F_FIN, F_FIN_ACK)`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FinStage {
    Idle,
    Requesting,
    Replying,
}

fn idle_seq() -> i64 {
    IDLE_SEQ
}

/// Per-direction control record (`c2s_ctrl` / `s2c_ctrl`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CtrlRecord {
    #[serde(rename = "F_SND", default)]
    pub snd: bool,
    #[serde(rename = "F_SND_ACK", default)]
    pub snd_ack: bool,
    /// Monotonic sequence number of the outstanding payload.
    #[serde(rename = "SEQ", default = "idle_seq")]
    pub seq: i64,
    /// Sequence number acknowledged by the receiver.
    #[serde(rename = "SEQ_ACK", default = "idle_seq")]
    pub seq_ack: i64,
    /// CRC32 of the payload blob, lowercase hex without `0x`.
    #[serde(rename = "CHECKSUM", default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(rename = "F_FIN", default)]
    pub fin: bool,
    #[serde(rename = "F_FIN_ACK", default)]
    pub fin_ack: bool,
}

impl Default for CtrlRecord {
    fn default() -> Self {
        CtrlRecord {
            snd: false,
            snd_ack: false,
            seq: IDLE_SEQ,
            seq_ack: IDLE_SEQ,
            checksum: None,
            fin: false,
            fin_ack: false,
        }
    }
}

impl CtrlRecord {
    pub fn snd_stage(&self) -> SndStage {
        match (self.snd, self.snd_ack) {
            (true, false) => SndStage::Requesting,
            (true, true) => SndStage::Replying,
            (false, _) => SndStage::Idle,
        }
    }

    pub fn fin_stage(&self) -> FinStage {
        match (self.fin, self.fin_ack) {
            (true, false) => FinStage::Requesting,
            (true, true) => FinStage::Replying,
            (false, _) => FinStage::Idle,
        }
    }

    /// FIN raised but not yet acknowledged: the receiver still owes the
    /// sender an ack before the channel may be torn down.
    pub fn finishing(&self) -> bool {
        self.fin_stage() == FinStage::Requesting
    }

    pub fn from_value(value: &serde_json::Value) -> Result<CtrlRecord, serde_json::Error> {
        serde_json::from_value(value.clone())
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap()
    }
}

/// One pending connect request in a listen backlog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    /// Reserved for future use.
    #[serde(rename = "CLIENT_ADDRESS", default, skip_serializing_if = "Option::is_none")]
    pub client_address: Option<String>,
    #[serde(rename = "F_CONN", default)]
    pub conn: bool,
    #[serde(rename = "F_CONN_ACK", default)]
    pub conn_ack: bool,
    /// Connection number assigned by the accepting server.
    #[serde(rename = "CONN_NUM", default, skip_serializing_if = "Option::is_none")]
    pub conn_num: Option<u32>,
}

impl RequestRecord {
    /// The record a client files (and re-files, if it goes missing) while
    /// requesting a connection.
    pub fn connect() -> RequestRecord {
        RequestRecord {
            client_address: Some("reserved".to_owned()),
            conn: true,
            conn_ack: false,
            conn_num: None,
        }
    }

    pub fn from_value(value: &serde_json::Value) -> Result<RequestRecord, serde_json::Error> {
        serde_json::from_value(value.clone())
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap()
    }
}

/// Synthesised view of a listen-backlog directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BacklogRecord {
    #[serde(rename = "PENDING", default)]
    pub pending: usize,
    #[serde(rename = "REQUEST_TOKENS", default)]
    pub request_tokens: Vec<String>,
}

impl BacklogRecord {
    pub fn from_value(value: &serde_json::Value) -> Result<BacklogRecord, serde_json::Error> {
        serde_json::from_value(value.clone())
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap()
    }
}
