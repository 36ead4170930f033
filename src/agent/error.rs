use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("tool {name} timed out after {timeout_ms} ms")]
    ToolTimeout { name: String, timeout_ms: u64 },

    #[error("no pending tool call with id {0}")]
    UnknownToolCall(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_error_display() {
        let error = AgentError::ToolTimeout {
            name: "execute_bash".to_string(),
            timeout_ms: 50,
        };
        assert_eq!(format!("{}", error), "tool execute_bash timed out after 50 ms");

        let error = AgentError::UnknownToolCall("call_9".to_string());
        assert_eq!(format!("{}", error), "no pending tool call with id call_9");
    }
}
