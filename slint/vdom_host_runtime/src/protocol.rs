use crate::error::FrameError;
use crate::tree::{VDomElem, VDomTransferElem};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::io::{Read, Write};
use std::sync::mpsc::Receiver;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

pub const OUTBOUND_FRAME_CAP: usize = 262_144;
pub const INBOUND_FRAME_CAP: usize = 4_194_304;

pub const REF_OP_FOCUS: &str = "focus";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FrontendEnvelope {
    #[serde(rename = "frontendupdate")]
    Update(FrontendUpdate),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BackendEnvelope {
    #[serde(rename = "backendupdate")]
    Update(BackendUpdate),

    /// The remote has work queued and wants a round as soon as possible.
    #[serde(rename = "asyncinitiationrequest")]
    AsyncInitiation {
        #[serde(default)]
        ts: i64,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrontendUpdate {
    pub ts: i64,
    #[serde(rename = "clientid")]
    pub client_id: String,
    #[serde(rename = "requestid")]
    pub request_id: u64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub resync: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub dispose: bool,
    #[serde(rename = "rendercontext")]
    pub render_context: VDomRenderContext,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<VDomEvent>,
    #[serde(rename = "statesync", default, skip_serializing_if = "Vec::is_empty")]
    pub state_sync: Vec<VDomStateSync>,
    #[serde(rename = "refupdates", default, skip_serializing_if = "Vec::is_empty")]
    pub ref_updates: Vec<VDomRefUpdate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<VDomMessage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendUpdate {
    #[serde(default)]
    pub ts: i64,
    #[serde(rename = "responseid", default)]
    pub response_id: u64,
    #[serde(rename = "haswork", default)]
    pub has_work: bool,
    #[serde(rename = "renderupdates", default, deserialize_with = "decode_render_updates")]
    pub render_updates: Vec<VDomRenderUpdate>,
    /// Flat element list the render updates refer to by `vdomwaveid`.
    #[serde(rename = "transferelems", default, deserialize_with = "decode_transfer_elems")]
    pub transfer_elems: Vec<VDomTransferElem>,
    #[serde(rename = "statesync", default)]
    pub state_sync: Vec<VDomStateSync>,
    #[serde(rename = "refoperations", default)]
    pub ref_operations: Vec<VDomRefOperation>,
    #[serde(default)]
    pub messages: Vec<VDomMessage>,
    /// Set on every chunk of a split response but the last.
    #[serde(default, skip_serializing_if = "is_false")]
    pub more: bool,
}

impl BackendUpdate {
    /// Appends a continuation chunk of the same response.
    pub fn absorb(&mut self, chunk: BackendUpdate) {
        self.has_work |= chunk.has_work;
        self.more = chunk.more;
        self.render_updates.extend(chunk.render_updates);
        self.transfer_elems.extend(chunk.transfer_elems);
        self.state_sync.extend(chunk.state_sync);
        self.ref_operations.extend(chunk.ref_operations);
        self.messages.extend(chunk.messages);
    }
}

fn decode_render_updates<'de, D>(deserializer: D) -> Result<Vec<VDomRenderUpdate>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Vec<Value>>::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(VDomRenderUpdate::from_wire)
        .collect())
}

fn decode_transfer_elems<'de, D>(deserializer: D) -> Result<Vec<VDomTransferElem>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Vec<Value>>::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter_map(|elem| match serde_json::from_value(elem) {
            Ok(elem) => Some(elem),
            Err(err) => {
                warn!(%err, "dropping malformed transfer element");
                None
            }
        })
        .collect())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VDomRenderContext {
    pub focused: bool,
    pub width: u32,
    pub height: u32,
    #[serde(rename = "rootrefid")]
    pub root_ref_id: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub background: bool,
}

/// A user interaction. `event_type` is the handler prop it fired
/// (`onClick`), which is how the remote looks the handler up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VDomEvent {
    #[serde(rename = "waveid")]
    pub node_id: String,
    #[serde(rename = "eventtype")]
    pub event_type: String,
    #[serde(rename = "globaleventtype", default, skip_serializing_if = "String::is_empty")]
    pub global_event_type: String,
    #[serde(flatten)]
    pub detail: EventDetail,
}

impl VDomEvent {
    pub fn new(node_id: impl Into<String>, event_type: impl Into<String>, detail: EventDetail) -> Self {
        Self {
            node_id: node_id.into(),
            event_type: event_type.into(),
            global_event_type: String::new(),
            detail,
        }
    }
}

/// What the native layer knows about an interaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventDetail {
    #[serde(rename = "targetvalue", default, skip_serializing_if = "Option::is_none")]
    pub target_value: Option<String>,
    #[serde(rename = "targetchecked", default, skip_serializing_if = "is_false")]
    pub target_checked: bool,
    #[serde(rename = "keydata", default, skip_serializing_if = "Option::is_none")]
    pub key_data: Option<KeyData>,
    #[serde(rename = "mousedata", default, skip_serializing_if = "Option::is_none")]
    pub mouse_data: Option<PointerData>,
}

impl EventDetail {
    pub fn key_down(key: impl Into<String>) -> Self {
        Self {
            key_data: Some(KeyData {
                kind: "keydown".to_string(),
                key: key.into(),
                ..KeyData::default()
            }),
            ..Self::default()
        }
    }

    pub fn key(&self) -> Option<&str> {
        self.key_data.as_ref().map(|data| data.key.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyData {
    #[serde(rename = "type")]
    pub kind: String,
    pub key: String,
    #[serde(default)]
    pub code: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub repeat: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub shift: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub control: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub alt: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub meta: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerData {
    #[serde(default)]
    pub button: i64,
    #[serde(default)]
    pub buttons: i64,
    #[serde(rename = "clientx", default, skip_serializing_if = "is_zero")]
    pub client_x: i64,
    #[serde(rename = "clienty", default, skip_serializing_if = "is_zero")]
    pub client_y: i64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub shift: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub control: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub alt: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub meta: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VDomStateSync {
    #[serde(rename = "atom", alias = "name")]
    pub name: String,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomRect {
    pub top: i64,
    pub left: i64,
    pub right: i64,
    pub bottom: i64,
    pub width: i64,
    pub height: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VDomRefPosition {
    #[serde(rename = "offsetheight")]
    pub offset_height: i64,
    #[serde(rename = "offsetwidth")]
    pub offset_width: i64,
    #[serde(rename = "scrollheight")]
    pub scroll_height: i64,
    #[serde(rename = "scrollwidth")]
    pub scroll_width: i64,
    #[serde(rename = "scrolltop")]
    pub scroll_top: i64,
    #[serde(rename = "boundingclientrect")]
    pub bounding_client_rect: DomRect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VDomRefUpdate {
    #[serde(rename = "refid")]
    pub ref_id: String,
    #[serde(rename = "hascurrent")]
    pub has_current: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<VDomRefPosition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RenderUpdateKind {
    Root,
    Append,
    Insert,
    Replace,
    Remove,
    Unknown(String),
    /// An op that could not be decoded; carries the reason.
    Invalid(String),
}

impl From<String> for RenderUpdateKind {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "root" => RenderUpdateKind::Root,
            "append" => RenderUpdateKind::Append,
            "insert" => RenderUpdateKind::Insert,
            "replace" => RenderUpdateKind::Replace,
            "remove" => RenderUpdateKind::Remove,
            _ => RenderUpdateKind::Unknown(raw),
        }
    }
}

impl From<RenderUpdateKind> for String {
    fn from(kind: RenderUpdateKind) -> Self {
        match kind {
            RenderUpdateKind::Root => "root".to_string(),
            RenderUpdateKind::Append => "append".to_string(),
            RenderUpdateKind::Insert => "insert".to_string(),
            RenderUpdateKind::Replace => "replace".to_string(),
            RenderUpdateKind::Remove => "remove".to_string(),
            RenderUpdateKind::Unknown(raw) => raw,
            RenderUpdateKind::Invalid(_) => "invalid".to_string(),
        }
    }
}

/// One patch operation. `target_id` names the parent for every kind but `root`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VDomRenderUpdate {
    #[serde(rename = "updatetype")]
    pub kind: RenderUpdateKind,
    #[serde(rename = "waveid", default, skip_serializing_if = "String::is_empty")]
    pub target_id: String,
    /// Names the op's element in the update's `transferelems`.
    #[serde(rename = "vdomwaveid", default, skip_serializing_if = "String::is_empty")]
    pub vdom_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vdom: Option<VDomElem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<i64>,
}

impl VDomRenderUpdate {
    /// Decodes one op. A malformed op becomes `Invalid` so the rest of its
    /// batch still applies.
    pub fn from_wire(raw: Value) -> Self {
        serde_json::from_value(raw).unwrap_or_else(|err| Self {
            kind: RenderUpdateKind::Invalid(err.to_string()),
            target_id: String::new(),
            vdom_id: String::new(),
            vdom: None,
            index: None,
        })
    }

    pub fn root(vdom: VDomElem) -> Self {
        Self {
            kind: RenderUpdateKind::Root,
            target_id: String::new(),
            vdom_id: String::new(),
            vdom: Some(vdom),
            index: None,
        }
    }

    pub fn append(parent: impl Into<String>, vdom: VDomElem) -> Self {
        Self {
            kind: RenderUpdateKind::Append,
            target_id: parent.into(),
            vdom_id: String::new(),
            vdom: Some(vdom),
            index: None,
        }
    }

    pub fn insert(parent: impl Into<String>, index: i64, vdom: VDomElem) -> Self {
        Self {
            kind: RenderUpdateKind::Insert,
            target_id: parent.into(),
            vdom_id: String::new(),
            vdom: Some(vdom),
            index: Some(index),
        }
    }

    pub fn replace(parent: impl Into<String>, index: i64, vdom: VDomElem) -> Self {
        Self {
            kind: RenderUpdateKind::Replace,
            target_id: parent.into(),
            vdom_id: String::new(),
            vdom: Some(vdom),
            index: Some(index),
        }
    }

    pub fn remove(parent: impl Into<String>, index: i64) -> Self {
        Self {
            kind: RenderUpdateKind::Remove,
            target_id: parent.into(),
            vdom_id: String::new(),
            vdom: None,
            index: Some(index),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VDomRefOperation {
    #[serde(rename = "refid")]
    pub ref_id: String,
    pub op: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VDomMessage {
    #[serde(rename = "messagetype")]
    pub message_type: String,
    pub message: String,
    #[serde(rename = "stacktrace", default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Value>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

pub fn writer_loop<W: Write>(
    writer: &mut W,
    rx: Receiver<FrontendEnvelope>,
    max_payload: usize,
) -> Result<(), FrameError> {
    for envelope in rx {
        let payload = encode_frontend_envelope(&envelope)?;
        write_frame(writer, &payload, max_payload)?;
        writer.flush()?;
    }

    Ok(())
}

/// Reads frames until EOF. A frame that is not a valid envelope is handed to
/// `on_envelope` as an error and reading continues; I/O failures end the loop.
pub fn reader_loop<R, F>(reader: &mut R, max_payload: usize, mut on_envelope: F) -> Result<(), FrameError>
where
    R: Read,
    F: FnMut(Result<BackendEnvelope, FrameError>),
{
    loop {
        match read_frame(reader, max_payload) {
            Ok(payload) => on_envelope(decode_backend_envelope(&payload)),
            Err(err) if err.is_eof() => return Ok(()),
            Err(err) => return Err(err),
        }
    }
}

pub fn encode_frontend_envelope(envelope: &FrontendEnvelope) -> Result<Vec<u8>, FrameError> {
    Ok(serde_json::to_vec(envelope)?)
}

pub fn decode_backend_envelope(payload: &[u8]) -> Result<BackendEnvelope, FrameError> {
    Ok(serde_json::from_slice(payload)?)
}

pub fn read_frame(reader: &mut impl Read, max_payload: usize) -> Result<Vec<u8>, FrameError> {
    let mut len_buf = [0_u8; 4];
    reader.read_exact(&mut len_buf)?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_payload {
        return Err(FrameError::TooLarge {
            len,
            max: max_payload,
        });
    }

    let mut payload = vec![0_u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

pub fn write_frame(
    writer: &mut impl Write,
    payload: &[u8],
    max_payload: usize,
) -> Result<(), FrameError> {
    if payload.len() > max_payload {
        return Err(FrameError::TooLarge {
            len: payload.len(),
            max: max_payload,
        });
    }

    let len = u32::try_from(payload.len()).map_err(|_| FrameError::LengthOverflow)?;

    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    Ok(())
}
