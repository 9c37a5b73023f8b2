use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::error::{ForemanBotError, Result};

pub const PROTOCOL_VERSION: &str = "1.2";

/// Closed set of wire message kinds: every command has exactly one matching
/// response kind, plus the generic error response agents fall back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    GetCpuTemp,
    GetMemoryInfo,
    GetDiskInfo,
    GetUptime,
    GetProcesses,
    GetNetworkInfo,
    ListContainers,
    StartContainer,
    StopContainer,
    RestartContainer,
    RemoveContainer,
    CreateContainer,
    UpdateAgent,
    CpuTempResponse,
    MemoryInfoResponse,
    DiskInfoResponse,
    UptimeResponse,
    ProcessesResponse,
    NetworkInfoResponse,
    ContainersResponse,
    StartContainerResponse,
    StopContainerResponse,
    RestartContainerResponse,
    RemoveContainerResponse,
    CreateContainerResponse,
    UpdateAgentResponse,
    ErrorResponse,
}

impl MessageType {
    pub fn response_for(self) -> Option<MessageType> {
        match self {
            MessageType::GetCpuTemp => Some(MessageType::CpuTempResponse),
            MessageType::GetMemoryInfo => Some(MessageType::MemoryInfoResponse),
            MessageType::GetDiskInfo => Some(MessageType::DiskInfoResponse),
            MessageType::GetUptime => Some(MessageType::UptimeResponse),
            MessageType::GetProcesses => Some(MessageType::ProcessesResponse),
            MessageType::GetNetworkInfo => Some(MessageType::NetworkInfoResponse),
            MessageType::ListContainers => Some(MessageType::ContainersResponse),
            MessageType::StartContainer => Some(MessageType::StartContainerResponse),
            MessageType::StopContainer => Some(MessageType::StopContainerResponse),
            MessageType::RestartContainer => Some(MessageType::RestartContainerResponse),
            MessageType::RemoveContainer => Some(MessageType::RemoveContainerResponse),
            MessageType::CreateContainer => Some(MessageType::CreateContainerResponse),
            MessageType::UpdateAgent => Some(MessageType::UpdateAgentResponse),
            _ => None,
        }
    }

    pub fn is_command(self) -> bool {
        self.response_for().is_some()
    }

    pub fn is_response(self) -> bool {
        !self.is_command()
    }

    /// Cache key for telemetry mirrored by the metrics cache consumer.
    /// Only read-only metric responses are cacheable.
    pub fn metric_name(self) -> Option<&'static str> {
        match self {
            MessageType::CpuTempResponse => Some("cpu_temp"),
            MessageType::MemoryInfoResponse => Some("memory_info"),
            MessageType::DiskInfoResponse => Some("disk_info"),
            MessageType::UptimeResponse => Some("uptime"),
            MessageType::ProcessesResponse => Some("processes"),
            MessageType::NetworkInfoResponse => Some("network_info"),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::GetCpuTemp => "get_cpu_temp",
            MessageType::GetMemoryInfo => "get_memory_info",
            MessageType::GetDiskInfo => "get_disk_info",
            MessageType::GetUptime => "get_uptime",
            MessageType::GetProcesses => "get_processes",
            MessageType::GetNetworkInfo => "get_network_info",
            MessageType::ListContainers => "list_containers",
            MessageType::StartContainer => "start_container",
            MessageType::StopContainer => "stop_container",
            MessageType::RestartContainer => "restart_container",
            MessageType::RemoveContainer => "remove_container",
            MessageType::CreateContainer => "create_container",
            MessageType::UpdateAgent => "update_agent",
            MessageType::CpuTempResponse => "cpu_temp_response",
            MessageType::MemoryInfoResponse => "memory_info_response",
            MessageType::DiskInfoResponse => "disk_info_response",
            MessageType::UptimeResponse => "uptime_response",
            MessageType::ProcessesResponse => "processes_response",
            MessageType::NetworkInfoResponse => "network_info_response",
            MessageType::ContainersResponse => "containers_response",
            MessageType::StartContainerResponse => "start_container_response",
            MessageType::StopContainerResponse => "stop_container_response",
            MessageType::RestartContainerResponse => "restart_container_response",
            MessageType::RemoveContainerResponse => "remove_container_response",
            MessageType::CreateContainerResponse => "create_container_response",
            MessageType::UpdateAgentResponse => "update_agent_response",
            MessageType::ErrorResponse => "error_response",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The wire envelope every transport carries. The id is assigned once per
/// command and must come back unchanged on the matching response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<i64>,
    pub server_key: String,
    pub version: String,
    #[serde(default)]
    pub payload: Value,
}

impl Message {
    pub fn new(kind: MessageType, server_key: &str, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            timestamp: now_ms(),
            server_id: None,
            server_key: server_key.to_string(),
            version: PROTOCOL_VERSION.to_string(),
            payload,
        }
    }

    /// A response envelope reusing the command's correlation id.
    pub fn response_to(command: &Message, kind: MessageType, payload: Value) -> Self {
        Self {
            id: command.id.clone(),
            kind,
            timestamp: now_ms(),
            server_id: command.server_id,
            server_key: command.server_key.clone(),
            version: PROTOCOL_VERSION.to_string(),
            payload,
        }
    }

    pub fn error_response(command: &Message, error: &str) -> Self {
        Self::response_to(
            command,
            MessageType::ErrorResponse,
            serde_json::json!({ "error": error }),
        )
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ForemanBotError::Decode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| ForemanBotError::Decode(e.to_string()))
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| ForemanBotError::Decode(e.to_string()))
    }

    /// Remote-supplied text of an error_response; falls back to the raw
    /// payload when the agent sent something unexpected.
    pub fn error_text(&self) -> String {
        self.payload
            .get("error")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| self.payload.to_string())
    }
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuTemp {
    pub temperature: f64,
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub total: u64,
    pub used: u64,
    pub available: u64,
    pub free: u64,
    pub buffers: u64,
    pub cached: u64,
    pub used_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskEntry {
    pub filesystem: String,
    pub mount_point: String,
    pub total: u64,
    pub used: u64,
    pub available: u64,
    pub used_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UptimeInfo {
    pub seconds: u64,
    pub formatted: String,
    pub boot_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub status: String,
    pub user: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceCounters {
    pub name: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes_per_sec: f64,
    pub tx_bytes_per_sec: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub interfaces: Vec<InterfaceCounters>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub status: String,
    #[serde(default)]
    pub ports: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerActionResult {
    pub success: bool,
    pub message: String,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentUpdateResult {
    pub success: bool,
    pub old_version: String,
    pub new_version: String,
    pub restart_required: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fresh_ids_and_response_mapping() {
        let a = Message::new(MessageType::GetCpuTemp, "key-1", Value::Null);
        let b = Message::new(MessageType::GetCpuTemp, "key-1", Value::Null);
        assert_ne!(a.id, b.id);
        assert_eq!(
            MessageType::GetCpuTemp.response_for(),
            Some(MessageType::CpuTempResponse)
        );
        assert!(MessageType::StopContainer.is_command());
        assert!(MessageType::ErrorResponse.is_response());
        assert_eq!(MessageType::ErrorResponse.response_for(), None);
    }

    #[test]
    fn encode_decode_round_trips_every_kind() {
        let kinds = [
            (MessageType::GetCpuTemp, Value::Null),
            (MessageType::CpuTempResponse, json!({"temperature": 45.5, "unit": "C"})),
            (MessageType::GetMemoryInfo, Value::Null),
            (
                MessageType::MemoryInfoResponse,
                json!({"total": 16, "used": 8, "available": 8, "free": 4, "buffers": 1, "cached": 3, "used_percent": 50.0}),
            ),
            (MessageType::ListContainers, Value::Null),
            (
                MessageType::ContainersResponse,
                json!([{"id": "c1", "name": "web", "image": "nginx", "state": "running", "status": "Up", "ports": ["80:80"]}]),
            ),
            (MessageType::StopContainer, json!({"name": "web"})),
            (
                MessageType::StopContainerResponse,
                json!({"success": true, "message": "stopped", "state": "exited"}),
            ),
            (MessageType::UpdateAgent, Value::Null),
            (
                MessageType::UpdateAgentResponse,
                json!({"success": true, "old_version": "1.1", "new_version": "1.2", "restart_required": true}),
            ),
            (MessageType::ErrorResponse, json!({"error": "boom"})),
        ];
        for (kind, payload) in kinds {
            let message = Message::new(kind, "server-key", payload);
            let decoded = Message::decode(&message.encode().unwrap()).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn wire_names_match_serde() {
        let message = Message::new(MessageType::GetCpuTemp, "k", Value::Null);
        let raw = serde_json::to_value(&message).unwrap();
        assert_eq!(raw["type"], "get_cpu_temp");
        for kind in [
            MessageType::CpuTempResponse,
            MessageType::StopContainer,
            MessageType::ErrorResponse,
        ] {
            assert_eq!(serde_json::to_value(kind).unwrap(), kind.as_str());
        }
    }

    #[test]
    fn decode_rejects_malformed_bytes() {
        assert!(matches!(
            Message::decode(b"{not json"),
            Err(crate::error::ForemanBotError::Decode(_))
        ));
        assert!(matches!(
            Message::decode(b"{\"id\": \"x\", \"type\": \"no_such_kind\"}"),
            Err(crate::error::ForemanBotError::Decode(_))
        ));
    }

    #[test]
    fn error_response_carries_text() {
        let command = Message::new(MessageType::GetUptime, "k", Value::Null);
        let reply = Message::error_response(&command, "agent offline");
        assert_eq!(reply.id, command.id);
        assert_eq!(reply.kind, MessageType::ErrorResponse);
        assert_eq!(reply.error_text(), "agent offline");
    }
}
