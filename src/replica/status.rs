//! Parsing of `SHOW REPLICA STATUS\G`

use std::collections::HashMap;

/// Replication health as reported by the replica itself
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaStatus {
    /// Replica_IO_Running: Yes, No or Connecting
    pub io_running: String,
    /// Replica_SQL_Running: Yes or No
    pub sql_running: String,
    pub seconds_behind_source: Option<u64>,
    pub source_host: Option<String>,
    pub last_error: Option<String>,
}

impl ReplicaStatus {
    /// Parse vertical (`\G`) output. Returns None when the server has no
    /// replication channel configured (empty result set).
    pub fn parse(output: &str) -> Option<Self> {
        let fields: HashMap<&str, &str> = output
            .lines()
            .filter_map(|line| line.split_once(':'))
            .map(|(k, v)| (k.trim(), v.trim()))
            .collect();

        // MySQL 8.0.22+ says Replica/Source, older servers say Slave/Master
        let get = |new: &str, old: &str| {
            fields
                .get(new)
                .or_else(|| fields.get(old))
                .map(|v| v.to_string())
        };

        let io_running = get("Replica_IO_Running", "Slave_IO_Running")?;
        let sql_running = get("Replica_SQL_Running", "Slave_SQL_Running")?;

        let last_error = [
            get("Last_IO_Error", "Last_IO_Error"),
            get("Last_SQL_Error", "Last_SQL_Error"),
        ]
        .into_iter()
        .flatten()
        .find(|e| !e.is_empty());

        Some(Self {
            io_running,
            sql_running,
            seconds_behind_source: get("Seconds_Behind_Source", "Seconds_Behind_Master")
                .and_then(|v| v.parse().ok()),
            source_host: get("Source_Host", "Master_Host").filter(|h| !h.is_empty()),
            last_error,
        })
    }

    /// SQL thread applying and IO thread connected or connecting
    pub fn is_healthy(&self) -> bool {
        self.sql_running == "Yes" && matches!(self.io_running.as_str(), "Yes" | "Connecting")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUNNING: &str = r#"*************************** 1. row ***************************
             Replica_IO_State: Waiting for source to send event
                  Source_Host: master
                  Source_User: replicator
                  Source_Port: 3306
           Replica_IO_Running: Yes
          Replica_SQL_Running: Yes
                Last_IO_Error:
               Last_SQL_Error:
        Seconds_Behind_Source: 0
"#;

    #[test]
    fn test_parse_running() {
        let status = ReplicaStatus::parse(RUNNING).unwrap();
        assert!(status.is_healthy());
        assert_eq!(status.seconds_behind_source, Some(0));
        assert_eq!(status.source_host.as_deref(), Some("master"));
        assert!(status.last_error.is_none());
    }

    #[test]
    fn test_parse_legacy_broken() {
        let output = r#"
             Slave_IO_Running: No
            Slave_SQL_Running: Yes
                Last_IO_Error: error connecting to master 'replicator@master:3306' - retry-time: 60
        Seconds_Behind_Master: NULL
"#;
        let status = ReplicaStatus::parse(output).unwrap();
        assert!(!status.is_healthy());
        assert_eq!(status.seconds_behind_source, None);
        assert!(status.last_error.unwrap().contains("error connecting"));
    }

    #[test]
    fn test_parse_unconfigured() {
        assert!(ReplicaStatus::parse("").is_none());
    }
}
