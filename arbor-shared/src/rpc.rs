//! RPC message schema.
//!
//! Hand-written `prost` message types; the wire layout is plain protobuf
//! behind the varint framing of [`crate::wire`]. A request carries exactly
//! one body variant; a request that decodes with no recognized body is
//! answered with `InvalidMethod`.

use std::collections::HashMap;

/// One framed client request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Request {
    #[prost(
        oneof = "request::Body",
        tags = "1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 20, 21, 22, 23, 24, 30, 31, 32, 40"
    )]
    pub body: Option<request::Body>,
}

pub mod request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "1")]
        Create(super::CreateRequest),
        #[prost(message, tag = "2")]
        Destroy(super::DestroyRequest),
        #[prost(message, tag = "3")]
        Start(super::StartRequest),
        #[prost(message, tag = "4")]
        Stop(super::StopRequest),
        #[prost(message, tag = "5")]
        Pause(super::PauseRequest),
        #[prost(message, tag = "6")]
        Resume(super::ResumeRequest),
        #[prost(message, tag = "7")]
        Kill(super::KillRequest),
        #[prost(message, tag = "8")]
        Respawn(super::RespawnRequest),
        #[prost(message, tag = "9")]
        List(super::ListRequest),
        #[prost(message, tag = "10")]
        GetProperty(super::GetPropertyRequest),
        #[prost(message, tag = "11")]
        SetProperty(super::SetPropertyRequest),
        #[prost(message, tag = "12")]
        Attach(super::AttachRequest),
        #[prost(message, tag = "13")]
        Wait(super::WaitRequest),
        #[prost(message, tag = "14")]
        StopAsyncWait(super::StopAsyncWaitRequest),
        #[prost(message, tag = "15")]
        FindTaskContainer(super::FindTaskContainerRequest),
        #[prost(message, tag = "16")]
        SetLabel(super::SetLabelRequest),
        #[prost(message, tag = "20")]
        CreateVolume(super::CreateVolumeRequest),
        #[prost(message, tag = "21")]
        TuneVolume(super::TuneVolumeRequest),
        #[prost(message, tag = "22")]
        LinkVolume(super::LinkVolumeRequest),
        #[prost(message, tag = "23")]
        UnlinkVolume(super::UnlinkVolumeRequest),
        #[prost(message, tag = "24")]
        ListVolumes(super::ListVolumesRequest),
        #[prost(message, tag = "30")]
        ImportLayer(super::ImportLayerRequest),
        #[prost(message, tag = "31")]
        RemoveLayer(super::RemoveLayerRequest),
        #[prost(message, tag = "32")]
        ListLayers(super::ListLayersRequest),
        #[prost(message, tag = "40")]
        GetSystem(super::GetSystemRequest),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateRequest {
    #[prost(string, tag = "1")]
    pub name: String,
    /// Weak containers are destroyed when their creating client disconnects.
    #[prost(bool, tag = "2")]
    pub weak: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DestroyRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StopRequest {
    #[prost(string, tag = "1")]
    pub name: String,
    /// Graceful termination budget before SIGKILL escalation.
    #[prost(uint64, optional, tag = "2")]
    pub timeout_ms: Option<u64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PauseRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResumeRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KillRequest {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(int32, tag = "2")]
    pub signal: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RespawnRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListRequest {
    /// Optional glob-style mask over client-visible names.
    #[prost(string, optional, tag = "1")]
    pub mask: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetPropertyRequest {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub property: String,
    /// Refresh runtime counters before reading.
    #[prost(bool, tag = "3")]
    pub sync: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetPropertyRequest {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub property: String,
    #[prost(string, tag = "3")]
    pub value: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AttachRequest {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(uint32, tag = "2")]
    pub pid: u32,
    /// Expected /proc/pid/comm, rejects recycled pids when set.
    #[prost(string, optional, tag = "3")]
    pub comm: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WaitRequest {
    /// Exact container names to watch.
    #[prost(string, repeated, tag = "1")]
    pub names: Vec<String>,
    /// Wildcard patterns over container names.
    #[prost(string, repeated, tag = "2")]
    pub wildcards: Vec<String>,
    #[prost(uint64, optional, tag = "3")]
    pub timeout_ms: Option<u64>,
    /// Only fire for these states; empty means any terminal transition.
    #[prost(string, repeated, tag = "4")]
    pub target_states: Vec<String>,
    /// Label pattern `<name>=<glob>` to match against container labels.
    #[prost(string, optional, tag = "5")]
    pub label: Option<String>,
    /// Async waiters persist until StopAsyncWait.
    #[prost(bool, tag = "6")]
    pub asynchronous: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StopAsyncWaitRequest {
    #[prost(string, repeated, tag = "1")]
    pub names: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FindTaskContainerRequest {
    #[prost(uint32, tag = "1")]
    pub pid: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetLabelRequest {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub label: String,
    #[prost(string, tag = "3")]
    pub value: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateVolumeRequest {
    /// Empty path requests an auto path under the place.
    #[prost(string, tag = "1")]
    pub path: String,
    /// Backend options: backend, storage, layers, space_limit, ...
    #[prost(map = "string, string", tag = "2")]
    pub properties: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TuneVolumeRequest {
    #[prost(string, tag = "1")]
    pub path: String,
    #[prost(map = "string, string", tag = "2")]
    pub properties: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LinkVolumeRequest {
    #[prost(string, tag = "1")]
    pub path: String,
    #[prost(string, tag = "2")]
    pub container: String,
    /// Mount target inside the container root; empty links without a mount.
    #[prost(string, tag = "3")]
    pub target: String,
    #[prost(bool, tag = "4")]
    pub read_only: bool,
    /// Required links stop the container when the volume goes away.
    #[prost(bool, tag = "5")]
    pub required: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UnlinkVolumeRequest {
    #[prost(string, tag = "1")]
    pub path: String,
    #[prost(string, tag = "2")]
    pub container: String,
    /// Strict unlink fails instead of destroying a last-link volume.
    #[prost(bool, tag = "3")]
    pub strict: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListVolumesRequest {
    #[prost(string, optional, tag = "1")]
    pub path: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub container: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ImportLayerRequest {
    #[prost(string, tag = "1")]
    pub layer: String,
    #[prost(string, tag = "2")]
    pub tarball: String,
    #[prost(string, optional, tag = "3")]
    pub place: Option<String>,
    #[prost(bool, tag = "4")]
    pub merge: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoveLayerRequest {
    #[prost(string, tag = "1")]
    pub layer: String,
    #[prost(string, optional, tag = "2")]
    pub place: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListLayersRequest {
    #[prost(string, optional, tag = "1")]
    pub place: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub mask: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetSystemRequest {}

/// One framed daemon response.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Response {
    /// [`crate::ErrorKind`] code; 0 is success, 13 (`Queued`) promises a
    /// later asynchronous response.
    #[prost(int32, tag = "1")]
    pub error: i32,
    #[prost(string, tag = "2")]
    pub error_message: String,
    #[prost(oneof = "response::Body", tags = "3, 4, 5, 6, 7, 8, 9")]
    pub body: Option<response::Body>,
}

pub mod response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "3")]
        List(super::ListResponse),
        #[prost(message, tag = "4")]
        Property(super::PropertyResponse),
        #[prost(message, tag = "5")]
        Wait(super::WaitResponse),
        #[prost(message, tag = "6")]
        Volume(super::VolumeDescription),
        #[prost(message, tag = "7")]
        VolumeList(super::ListVolumesResponse),
        #[prost(message, tag = "8")]
        LayerList(super::ListLayersResponse),
        #[prost(message, tag = "9")]
        System(super::SystemResponse),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListResponse {
    #[prost(string, repeated, tag = "1")]
    pub names: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PropertyResponse {
    #[prost(string, tag = "1")]
    pub value: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WaitResponse {
    /// Empty name with state "timeout" reports waiter expiry.
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub state: String,
    #[prost(uint64, tag = "3")]
    pub when_ms: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VolumeDescription {
    #[prost(string, tag = "1")]
    pub path: String,
    #[prost(map = "string, string", tag = "2")]
    pub properties: HashMap<String, String>,
    #[prost(string, repeated, tag = "3")]
    pub containers: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListVolumesResponse {
    #[prost(message, repeated, tag = "1")]
    pub volumes: Vec<VolumeDescription>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListLayersResponse {
    #[prost(string, repeated, tag = "1")]
    pub layers: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SystemResponse {
    #[prost(string, tag = "1")]
    pub version: String,
    #[prost(uint64, tag = "2")]
    pub start_time_ms: u64,
    #[prost(map = "string, uint64", tag = "3")]
    pub stats: HashMap<String, u64>,
}

impl Response {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn error(err: &crate::ArborError) -> Self {
        Self {
            error: err.kind.code(),
            error_message: err.message.clone(),
            body: None,
        }
    }

    pub fn with_body(body: response::Body) -> Self {
        Self {
            error: 0,
            error_message: String::new(),
            body: Some(body),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_request_roundtrip() {
        let req = Request {
            body: Some(request::Body::CreateVolume(CreateVolumeRequest {
                path: String::new(),
                properties: [("backend".to_string(), "overlay".to_string())]
                    .into_iter()
                    .collect(),
            })),
        };
        let bytes = req.encode_to_vec();
        let back = Request::decode(&bytes[..]).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn test_unknown_body_decodes_to_none() {
        // A message with only an unrecognized field: tag 1000, varint 7.
        let mut bytes = Vec::new();
        prost::encoding::encode_key(1000, prost::encoding::WireType::Varint, &mut bytes);
        prost::encoding::encode_varint(7, &mut bytes);
        let req = Request::decode(&bytes[..]).unwrap();
        assert!(req.body.is_none());
    }

    #[test]
    fn test_error_response() {
        let err = crate::ArborError::no_container("a/b");
        let resp = Response::error(&err);
        assert_eq!(
            crate::ErrorKind::from_code(resp.error),
            crate::ErrorKind::ContainerDoesNotExist
        );
        assert!(resp.error_message.contains("a/b"));
    }
}
