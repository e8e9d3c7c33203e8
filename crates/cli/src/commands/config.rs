use serde::Serialize;

use wardflow_core::config::{AppConfig, LoadOptions, LogFormat};

#[derive(Debug, Serialize)]
struct ConfigReport {
    status: &'static str,
    database: DatabaseSummary,
    approval: ApprovalSummary,
    escalation: EscalationSummary,
    server: ServerSummary,
    logging: LoggingSummary,
}

#[derive(Debug, Serialize)]
struct DatabaseSummary {
    url: String,
    max_connections: u32,
    timeout_secs: u64,
}

#[derive(Debug, Serialize)]
struct ApprovalSummary {
    chain: Vec<String>,
    roles: Vec<RoleSummary>,
    cross_hospital_entry_stage: String,
}

#[derive(Debug, Serialize)]
struct RoleSummary {
    role: String,
    stage: String,
}

#[derive(Debug, Serialize)]
struct EscalationSummary {
    sweep_interval_secs: u64,
    default_escalate_after_hours: i64,
    escalatable_stages: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ServerSummary {
    bind_address: String,
    health_check_port: u16,
    graceful_shutdown_secs: u64,
}

#[derive(Debug, Serialize)]
struct LoggingSummary {
    level: String,
    format: &'static str,
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return format!(
                "{{\"status\":\"error\",\"error_class\":\"config_validation\",\"message\":\"{}\"}}",
                error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
            );
        }
    };

    match build_report(&config) {
        Ok(report) => serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
                error.to_string().replace('"', "\\\"")
            )
        }),
        Err(message) => format!(
            "{{\"status\":\"error\",\"error_class\":\"approval_chain\",\"message\":\"{}\"}}",
            message.replace('"', "\\\"")
        ),
    }
}

fn build_report(config: &AppConfig) -> Result<ConfigReport, String> {
    let chain = config.approval_chain().map_err(|error| error.to_string())?;
    let roles = config.role_map().map_err(|error| error.to_string())?;
    let sweep_stages = config.sweep_stages().map_err(|error| error.to_string())?;

    let mut role_summaries: Vec<RoleSummary> = roles
        .roles()
        .map(|(role, stage)| RoleSummary {
            role: role.to_string(),
            stage: stage.as_str().to_string(),
        })
        .collect();
    role_summaries.sort_by(|left, right| left.role.cmp(&right.role));

    Ok(ConfigReport {
        status: "ok",
        database: DatabaseSummary {
            url: config.database.url.clone(),
            max_connections: config.database.max_connections,
            timeout_secs: config.database.timeout_secs,
        },
        approval: ApprovalSummary {
            chain: chain.stages().iter().map(|stage| stage.as_str().to_string()).collect(),
            roles: role_summaries,
            cross_hospital_entry_stage: chain
                .entry_stage(wardflow_core::domain::request::ScopeLevel::CrossHospital)
                .as_str()
                .to_string(),
        },
        escalation: EscalationSummary {
            sweep_interval_secs: config.escalation.sweep_interval_secs,
            default_escalate_after_hours: config.escalation.default_escalate_after_hours,
            escalatable_stages: sweep_stages
                .iter()
                .map(|stage| stage.as_str().to_string())
                .collect(),
        },
        server: ServerSummary {
            bind_address: config.server.bind_address.clone(),
            health_check_port: config.server.health_check_port,
            graceful_shutdown_secs: config.server.graceful_shutdown_secs,
        },
        logging: LoggingSummary {
            level: config.logging.level.clone(),
            format: match config.logging.format {
                LogFormat::Compact => "compact",
                LogFormat::Pretty => "pretty",
                LogFormat::Json => "json",
            },
        },
    })
}

#[cfg(test)]
mod tests {
    use super::run;

    #[test]
    fn config_report_is_valid_json_with_the_chain() {
        let output = run();
        let value: serde_json::Value =
            serde_json::from_str(&output).expect("config output should be JSON");
        assert_eq!(value["status"], "ok");
        assert!(value["approval"]["chain"].is_array());
    }
}
