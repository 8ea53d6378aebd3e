//! Configuration and connectivity check.
//!
//! `docparse check` reports, one line per concern, whether a run would be
//! able to start: the database opens and answers, and the completion
//! provider has what it needs. It makes no completion calls.

use anyhow::{bail, Result};

use crate::config::{CompletionConfig, Config};
use crate::db;

struct CheckLine {
    name: &'static str,
    status: String,
    healthy: bool,
}

fn completion_lines(config: &CompletionConfig) -> Vec<CheckLine> {
    if !config.is_enabled() {
        return vec![CheckLine {
            name: "completion",
            status: "DISABLED (extract only)".to_string(),
            healthy: true,
        }];
    }

    let mut lines = vec![CheckLine {
        name: "completion",
        status: format!("{} / {}", config.provider, config.model_name()),
        healthy: true,
    }];

    if config.provider == "openai" {
        let present = config.api_key.is_some();
        lines.push(CheckLine {
            name: "api key",
            status: if present {
                format!("OK ({} set)", config.api_key_env)
            } else {
                format!("MISSING ({} not set)", config.api_key_env)
            },
            healthy: present,
        });
    }

    lines
}

pub async fn run_check(config: &Config) -> Result<()> {
    let mut lines = Vec::new();

    let db_line = match db::connect(config).await {
        Ok(pool) => {
            let ok = db::ping(&pool).await.unwrap_or(false);
            pool.close().await;
            CheckLine {
                name: "database",
                status: if ok {
                    format!("OK ({})", config.db.path.display())
                } else {
                    format!("UNRESPONSIVE ({})", config.db.path.display())
                },
                healthy: ok,
            }
        }
        Err(e) => CheckLine {
            name: "database",
            status: format!("ERROR ({})", e),
            healthy: false,
        },
    };
    lines.push(db_line);
    lines.extend(completion_lines(&config.completion));
    lines.push(CheckLine {
        name: "rate limit",
        status: format!(
            "{} concurrent, {} ms apart, {} retries",
            config.rate_limit.max_concurrent,
            config.rate_limit.min_interval_ms,
            config.completion.max_retries
        ),
        healthy: true,
    });
    lines.push(CheckLine {
        name: "extract",
        status: config.extract.include_globs.join(", "),
        healthy: true,
    });

    println!("{:<16} {:<48} HEALTHY", "CHECK", "STATUS");
    for line in &lines {
        println!("{:<16} {:<48} {}", line.name, line.status, line.healthy);
    }

    let failed = lines.iter().filter(|l| !l.healthy).count();
    if failed > 0 {
        bail!("{} check(s) failed", failed);
    }
    println!("ok");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_without_key_is_unhealthy() {
        let lines = completion_lines(&CompletionConfig::default());
        let key = lines.iter().find(|l| l.name == "api key").unwrap();
        assert!(!key.healthy);
        assert!(key.status.contains("OPENAI_API_KEY"));
    }

    #[test]
    fn ollama_needs_no_key() {
        let config = CompletionConfig {
            provider: "ollama".to_string(),
            model: Some("llama3".to_string()),
            ..CompletionConfig::default()
        };
        let lines = completion_lines(&config);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].status, "ollama / llama3");
    }

    #[test]
    fn disabled_provider_is_reported() {
        let config = CompletionConfig {
            provider: "disabled".to_string(),
            ..CompletionConfig::default()
        };
        let lines = completion_lines(&config);
        assert!(lines[0].status.starts_with("DISABLED"));
        assert!(lines.iter().all(|l| l.healthy));
    }
}
