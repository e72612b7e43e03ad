//! latch-engine — single-process rule engine with in-memory storage.
//!
//! Wires the dispatcher, reverse index, engine ticker, and in-process
//! gateway implementations together, seeds a demo rule, and feeds it
//! synthetic door-sensor changes so the whole pipeline can be observed
//! from a terminal. Real deployments replace the in-memory repositories
//! and gateways with their SQL/MQTT/HTTP counterparts.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use clap::Parser;
use serde_json::Value as JsonValue;
use tokio::sync::Notify;
use tracing::info;

use latch_core::{config, DispatcherConfig, EntitySource, MemoryKv};
use latch_dispatch::{admin, Dispatcher, EngineTicker};
use latch_rules::executor::ActionExecutor;
use latch_rules::gateways::{
    AlarmServices, AlarmSnapshot, GatewayError, HomeAssistantGateway, NotificationDispatcher,
    NotificationReceipt, Zigbee2mqttGateway, ZwavejsGateway,
};
use latch_rules::repository::MemoryRepos;
use latch_rules::schema::{Rule, RuleDefinition, RuleKind};

// ── CLI ─────────────────────────────────────────────────────────────

/// In-memory latch rule engine demo.
#[derive(Parser, Debug)]
#[command(name = "latch-engine", version, about)]
struct Cli {
    /// Engine tick interval in seconds (for-delays and time windows).
    #[arg(long, env = "LATCH_TICK_SECONDS", default_value_t = 2)]
    tick_seconds: u64,

    /// Seconds between synthetic door-sensor toggles.
    #[arg(long, env = "LATCH_TOGGLE_SECONDS", default_value_t = 5)]
    toggle_seconds: u64,

    /// How long to run before exiting (0 = until ctrl-c).
    #[arg(long, env = "LATCH_RUN_SECONDS", default_value_t = 0)]
    run_seconds: u64,
}

// ── In-process gateways ─────────────────────────────────────────────

/// Alarm state machine held in process memory.
struct InProcessAlarm {
    state: Mutex<String>,
}

impl InProcessAlarm {
    fn new() -> Self {
        Self {
            state: Mutex::new("armed_home".to_string()),
        }
    }

    fn set(&self, state: &str, reason: &str) {
        info!(state, reason, "alarm transition");
        *self.state.lock().expect("alarm state lock poisoned") = state.to_string();
    }
}

#[async_trait]
impl AlarmServices for InProcessAlarm {
    async fn current_snapshot(&self, _process_timers: bool) -> Result<AlarmSnapshot, GatewayError> {
        Ok(AlarmSnapshot {
            current_state: self.state.lock().expect("alarm state lock poisoned").clone(),
        })
    }

    async fn arm(&self, target_state: &str, reason: &str) -> Result<(), GatewayError> {
        self.set(target_state, reason);
        Ok(())
    }

    async fn disarm(&self, reason: &str) -> Result<(), GatewayError> {
        self.set("disarmed", reason);
        Ok(())
    }

    async fn trigger(&self, reason: &str) -> Result<(), GatewayError> {
        self.set("triggered", reason);
        Ok(())
    }

    async fn cancel_arming(&self, reason: &str) -> Result<(), GatewayError> {
        self.set("disarmed", reason);
        Ok(())
    }
}

/// Gateways that just log what they would send.
struct LoggingGateways;

#[async_trait]
impl HomeAssistantGateway for LoggingGateways {
    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        _target: Option<&JsonValue>,
        _data: Option<&JsonValue>,
        _timeout: Duration,
    ) -> Result<(), GatewayError> {
        info!(domain, service, "ha_call_service");
        Ok(())
    }
}

#[async_trait]
impl ZwavejsGateway for LoggingGateways {
    async fn set_value(
        &self,
        node_id: i64,
        endpoint: i64,
        command_class: i64,
        _property: &JsonValue,
        _property_key: Option<&JsonValue>,
        _value: &JsonValue,
    ) -> Result<(), GatewayError> {
        info!(node_id, endpoint, command_class, "zwavejs_set_value");
        Ok(())
    }
}

#[async_trait]
impl Zigbee2mqttGateway for LoggingGateways {
    async fn set_entity_value(&self, entity_id: &str, value: &JsonValue) -> Result<(), GatewayError> {
        info!(entity_id, %value, "zigbee2mqtt set");
        Ok(())
    }
}

#[async_trait]
impl NotificationDispatcher for LoggingGateways {
    async fn enqueue(
        &self,
        provider_id: &str,
        message: &str,
        _title: Option<&str>,
        _data: Option<&JsonValue>,
        rule_name: &str,
    ) -> Result<NotificationReceipt, GatewayError> {
        info!(provider_id, message, rule_name, "notification queued");
        Ok(NotificationReceipt {
            delivery_id: uuid::Uuid::new_v4().to_string(),
            queued: true,
        })
    }
}

// ── main ────────────────────────────────────────────────────────────

fn demo_rule() -> Rule {
    Rule {
        id: 1,
        name: "door opens while armed".to_string(),
        kind: RuleKind::Trigger,
        enabled: true,
        priority: 10,
        cooldown_seconds: Some(15),
        definition: RuleDefinition {
            when: serde_json::from_value(serde_json::json!({
                "op": "all",
                "children": [
                    {"op": "entity_state", "entity_id": "binary_sensor.front_door", "equals": "on"},
                    {"op": "alarm_state_in", "states": ["armed_home", "armed_away"]}
                ]
            }))
            .expect("demo rule condition is valid JSON"),
            then: serde_json::from_value(serde_json::json!([
                {"type": "alarm_trigger"},
                {"type": "send_notification", "provider_id": "console",
                 "message": "Front door opened while armed"}
            ]))
            .expect("demo rule actions are valid JSON"),
        },
        schema_version: 1,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config::load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let dispatcher_config = DispatcherConfig::from_env();
    dispatcher_config.log_summary();

    let repos = Arc::new(MemoryRepos::new());
    let alarm = Arc::new(InProcessAlarm::new());
    let executor = Arc::new(ActionExecutor::new(
        alarm.clone(),
        Arc::new(LoggingGateways),
        Arc::new(LoggingGateways),
        Arc::new(LoggingGateways),
        Arc::new(LoggingGateways),
    ));

    let dispatcher = Dispatcher::new(
        dispatcher_config,
        repos.clone(),
        executor.clone(),
        Arc::new(MemoryKv::new()),
    );

    admin::save_rule(&*repos, dispatcher.index(), demo_rule(), true)
        .await
        .map_err(|e| anyhow::anyhow!("failed to seed demo rule: {e}"))?;
    info!("seeded demo rule");

    let shutdown = Arc::new(Notify::new());
    let ticker = EngineTicker::new(
        repos.clone(),
        executor.clone(),
        dispatcher.stats(),
        Duration::from_secs(cli.tick_seconds),
    );
    let ticker_handle = ticker.start(shutdown.clone());

    // Synthetic sensor: toggles the front door open/closed.
    let toggle_dispatcher = dispatcher.clone();
    let toggle_repos = repos.clone();
    let toggle_shutdown = shutdown.clone();
    let toggle_every = Duration::from_secs(cli.toggle_seconds.max(1));
    let toggle_handle = tokio::spawn(async move {
        let mut open = false;
        let mut interval = tokio::time::interval(toggle_every);
        loop {
            tokio::select! {
                _ = toggle_shutdown.notified() => break,
                _ = interval.tick() => {
                    open = !open;
                    let state = if open { "on" } else { "off" };
                    let now = Utc::now();
                    toggle_repos.record_entity_state(
                        "binary_sensor.front_door",
                        EntitySource::HomeAssistant,
                        Some(state.to_string()),
                        now,
                    );
                    info!(state, "door sensor changed");
                    toggle_dispatcher.notify_entities_changed(
                        EntitySource::HomeAssistant,
                        &["binary_sensor.front_door".to_string()],
                        Some(now),
                    );
                }
            }
        }
    });

    if cli.run_seconds > 0 {
        tokio::time::sleep(Duration::from_secs(cli.run_seconds)).await;
    } else {
        tokio::signal::ctrl_c().await?;
    }

    info!("shutting down");
    shutdown.notify_waiters();
    let _ = toggle_handle.await;
    let _ = ticker_handle.await;
    dispatcher.shutdown().await;

    let status = dispatcher.status();
    info!(
        triggered = status.stats.triggered,
        fired = status.stats.rules_fired,
        debounced = status.stats.debounced,
        audit_rows = repos.action_log().for_rule(1, 100).len(),
        "final dispatcher stats"
    );
    let sim = latch_rules::engine::simulate_rules(
        &*repos,
        &std::collections::HashMap::from([(
            "binary_sensor.front_door".to_string(),
            "on".to_string(),
        )]),
        Utc::now(),
        None,
        Some("armed_away".to_string()),
    )
    .await?;
    info!(
        matched = sim.summary.matched,
        evaluated = sim.summary.evaluated,
        "simulation: door open while armed_away"
    );
    Ok(())
}
