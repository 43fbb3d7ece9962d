//! Default configuration values
//!
//! Every tunable of the engine has a default here. The priority weights and
//! the memory tiers are configuration defaults, not values tuned for any
//! particular hardware.

/// Built-in configuration layer
pub struct DefaultConfig;

impl DefaultConfig {
    /// Default configuration as TOML
    pub const TOML: &'static str = r#"
[logging]
level = "info"
format = "pretty"
file_prefix = "sync-orchestrator.log"

[priority]
weight_operation_class = 0.4
weight_urgency = 0.3
weight_requester_context = 0.2
weight_health_class = 0.1
aging_bonus_per_sec = 0.05

[resolver]
max_queue_wait_ms = 30000
max_queue_length = 1024

[transaction]
default_step_timeout_ms = 5000
audit_retention_ms = 3600000
gc_interval_ms = 60000

[bus]
ack_timeout_ms = 2000
max_redeliveries = 5
history_per_source = 1024
redelivery_interval_ms = 500

[cascade]
window_ms = 3600000
automated_recovery_at = 1
forced_degradation_at = 5
system_protection_at = 10
overhead_ms = 250

[monitor]
interval_ms = 5000
threshold = 0.90
repair_target = 0.95
agent_timeout_ms = 2000
max_staleness_ms = 30000

[recovery]
memory_tiers = [0.80, 0.85, 0.90, 0.95]
latency_ceiling_ms = 500.0
error_rate_ceiling = 0.05
cooldown_ms = 30000

[persistence]
enabled = false
directory = "./state"

[capacity.device]
device_time = 1000

[capacity.memory]
memory_bytes = 10737418240

[capacity.model]
model_slot = 4

[capacity.processing]
processing_slot = 16

[capacity.inference]
inference_slot = 8

[capacity.postprocessing]
postprocessing_slot = 8
"#;
}
