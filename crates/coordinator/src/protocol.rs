use farm_core::{AgentState, PeerInfo};
use serde::{Deserialize, Serialize};

/// What the Agent tells the coordinator on every ping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PingReport {
    pub agent_id: String,
    pub state: AgentState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_for: Option<String>,
    pub version: String,
    pub address: String,
    #[serde(default)]
    pub trusted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load: Option<f32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorCommand {
    Shutdown,
    Restart,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PingResponse {
    #[serde(default)]
    pub peers: Vec<PeerInfo>,
    #[serde(default)]
    pub command: Option<CoordinatorCommand>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_tolerates_missing_fields() {
        let resp: PingResponse = serde_json::from_str("{}").unwrap();
        assert!(resp.peers.is_empty());
        assert!(resp.command.is_none());

        let resp: PingResponse = serde_json::from_str(
            r#"{"peers":[{"agentId":"b","address":"10.0.0.2:18800","state":"busy"}],"command":"restart"}"#,
        )
        .unwrap();
        assert_eq!(resp.peers[0].state, AgentState::Busy);
        assert_eq!(resp.command, Some(CoordinatorCommand::Restart));
    }
}
