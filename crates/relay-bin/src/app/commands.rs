//! Command handlers for the `broadmail-relay` binary.

use super::RelayState;
use broadmail_dispatcher::{CallOutcome, RequestDescriptor};
use delivery_queue_database::QueueStore;
use retry_scheduler::RetryRunner;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

type CommandResult = Result<ExitCode, Box<dyn std::error::Error>>;

/// Parse a `key=value` form field. The value may be empty or contain `=`.
pub fn parse_field(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got {:?}", s)),
    }
}

/// Print a call outcome; non-success maps to exit code 1.
pub fn report(outcome: CallOutcome) -> ExitCode {
    if outcome.success {
        println!("ok [{}]: {}", outcome.endpoint, outcome.message);
        ExitCode::SUCCESS
    } else {
        println!("failed [{}]: {}", outcome.endpoint, outcome.message);
        ExitCode::FAILURE
    }
}

/// Replay the backlog every `retry_interval_secs` until Ctrl-C.
pub async fn run(relay: &RelayState) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupt received, shutting down"),
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    run_until(relay, shutdown_rx).await;
}

/// Drive the runner until `shutdown` fires, then close the queue database.
async fn run_until(relay: &RelayState, shutdown: watch::Receiver<bool>) {
    let period = Duration::from_secs(relay.config.retry_interval_secs);
    RetryRunner::new(Arc::new(relay.scheduler()), period)
        .run(shutdown)
        .await;
    relay.close().await;
}

pub async fn tick(relay: &RelayState) -> CommandResult {
    let report = relay.scheduler().tick().await?;
    println!("{}", report);
    Ok(ExitCode::SUCCESS)
}

pub async fn submit(
    relay: &RelayState,
    endpoint: String,
    method: String,
    fields: Vec<(String, String)>,
) -> CommandResult {
    let request = RequestDescriptor::new(endpoint, method)
        .with_credential(relay.config.credential().map(str::to_string))
        .with_fields(fields);
    Ok(report(relay.dispatcher.submit(request).await?))
}

pub async fn status(relay: &RelayState, json: bool) -> CommandResult {
    let max_retry_count = relay.config.max_retry_count;
    let counts = relay.store.count_by_status().await?;
    let backlog = relay.store.select_retryable(max_retry_count).await?;

    if json {
        let value = serde_json::json!({
            "counts": counts,
            "max_retry_count": max_retry_count,
            "backlog": backlog,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(ExitCode::SUCCESS);
    }

    println!("success:       {}", counts.success);
    println!("network_error: {}", counts.network_error);
    println!("server_error:  {}", counts.server_error);
    println!("retryable:     {} (max_retry_count={})", backlog.len(), max_retry_count);

    for record in &backlog {
        println!(
            "{}  {}  retries={}  {}  {}",
            record.id(),
            record.created_at().to_rfc3339(),
            record.retry_count(),
            record.status(),
            record.error_message()
        );
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_config_and_utils::{Config, Paths};
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_parse_field() {
        assert_eq!(
            parse_field("firstname=Ada").unwrap(),
            ("firstname".to_string(), "Ada".to_string())
        );
        assert_eq!(
            parse_field("note=a=b").unwrap(),
            ("note".to_string(), "a=b".to_string())
        );
        assert_eq!(parse_field("empty=").unwrap().1, "");
        assert!(parse_field("novalue").is_err());
        assert!(parse_field("=x").is_err());
    }

    #[tokio::test]
    async fn test_failed_submit_shows_up_in_backlog() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/form/KEY/subscribe"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());
        let config = Config {
            api_base_url: server.uri(),
            auth_code: Some("KEY".to_string()),
            request_timeout_secs: 5,
            ..Config::default()
        };
        let relay = RelayState::open(config, paths.clone(), None).await.unwrap();

        submit(
            &relay,
            "form".to_string(),
            "subscribe".to_string(),
            vec![("bmRecipientId".to_string(), "a@b.com".to_string())],
        )
        .await
        .unwrap();
        assert!(paths.database_file().exists());

        let backlog = relay.store.select_retryable(5).await.unwrap();
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].error_message(), "server replied: 500");
        status(&relay, true).await.unwrap();
    }

    #[tokio::test]
    async fn test_tick_spools_alert_for_exhausted_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());
        let mut config = Config {
            api_base_url: server.uri(),
            auth_code: Some("KEY".to_string()),
            max_retry_count: 1,
            request_timeout_secs: 5,
            ..Config::default()
        };
        config.operator.address = Some("ops@shop.test".to_string());
        let relay = RelayState::open(config, paths.clone(), None).await.unwrap();

        let outcome = relay.api().subscribe("a@b.com", vec![]).await.unwrap();
        assert!(!outcome.success);

        tick(&relay).await.unwrap();

        let spooled: Vec<_> = std::fs::read_dir(paths.mail_spool_dir())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert_eq!(spooled.len(), 1);
        let message = std::fs::read_to_string(&spooled[0]).unwrap();
        assert!(message.contains("SERVER_ERROR\r\nserver replied: 503\r\n"));
        assert!(relay.store.select_retryable(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_closes_database_on_shutdown() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());
        let relay = RelayState::open(Config::default(), paths, None).await.unwrap();
        relay.store.health_check().await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), run_until(&relay, shutdown_rx))
            .await
            .unwrap();

        assert!(relay.store.health_check().await.is_err());
    }
}
