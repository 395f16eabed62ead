use anyhow::{Result, bail};
use clap::Parser;

/// Full configuration surface of the operator. Every flag has an environment
/// mirror so the container image can be configured without arguments.
/// Validation is fail-fast: a bad value refuses to start the process.
#[derive(Parser, Debug, Clone)]
pub struct OperatorArgs {
    /// Directory inside the pod that workspaces live under
    #[arg(long, env = "WORKSPACE_DIR", default_value = "/workspace")]
    pub workspace_dir: String,

    /// Sidecar health/liveness HTTP port
    #[arg(long, env = "SIDECAR_HTTP_PORT", default_value_t = 8686)]
    pub sidecar_http_port: u16,

    /// Sidecar wire-protocol RPC port
    #[arg(long, env = "SIDECAR_GRPC_PORT", default_value_t = 9090)]
    pub sidecar_grpc_port: u16,

    /// Image injected as the sidecar container of every pool pod
    #[arg(long, env = "SIDECAR_IMAGE", default_value = "ghcr.io/arl-dev/arl-sidecar:latest")]
    pub sidecar_image: String,

    /// Image whose init container installs the executor agent binary
    #[arg(
        long,
        env = "EXECUTOR_AGENT_IMAGE",
        default_value = "ghcr.io/arl-dev/arl-agent:latest"
    )]
    pub executor_agent_image: String,

    /// Timeout for outbound HTTP calls (audit sink), seconds
    #[arg(long, env = "HTTP_CLIENT_TIMEOUT_SECONDS", default_value_t = 30)]
    pub http_client_timeout_seconds: u64,

    /// Replica count applied to Pools that omit one
    #[arg(long, env = "DEFAULT_POOL_REPLICAS", default_value_t = 1)]
    pub default_pool_replicas: i32,

    /// Standard requeue delay between reconciliations, seconds
    #[arg(long, env = "DEFAULT_REQUEUE_DELAY_SECONDS", default_value_t = 10)]
    pub default_requeue_delay_seconds: u64,

    /// Requeue delay while a workspace waits for an idle pod, seconds
    #[arg(long, env = "POD_WAIT_REQUEUE_DELAY_SECONDS", default_value_t = 5)]
    pub pod_wait_requeue_delay_seconds: u64,

    /// Poll interval for Bound/Ready workspaces, seconds
    #[arg(long, env = "WORKSPACE_CHECK_INTERVAL_SECONDS", default_value_t = 30)]
    pub workspace_check_interval_seconds: u64,

    /// Controller-wide idle timeout applied when a Workspace sets none; 0 = never
    #[arg(long, env = "WORKSPACE_IDLE_TIMEOUT_SECONDS", default_value_t = 0)]
    pub workspace_idle_timeout_seconds: i64,

    /// Controller-wide max lifetime applied when a Workspace sets none; 0 = unbounded
    #[arg(long, env = "WORKSPACE_MAX_LIFETIME_SECONDS", default_value_t = 0)]
    pub workspace_max_lifetime_seconds: i64,

    /// Max concurrent Pool reconciliations
    #[arg(long, env = "POOL_MAX_CONCURRENT", default_value_t = 10)]
    pub pool_max_concurrent: u16,

    /// Max concurrent Workspace reconciliations
    #[arg(long, env = "WORKSPACE_MAX_CONCURRENT", default_value_t = 10)]
    pub workspace_max_concurrent: u16,

    /// Failure backoff base delay, milliseconds
    #[arg(long, env = "POOL_BASE_DELAY_MS", default_value_t = 500)]
    pub pool_base_delay_ms: u64,

    /// Failure backoff ceiling, milliseconds
    #[arg(long, env = "POOL_MAX_DELAY_MS", default_value_t = 30_000)]
    pub pool_max_delay_ms: u64,

    /// Token-bucket refill rate for pod create/delete calls
    #[arg(long, env = "POOL_RATE_LIMIT_QPS", default_value_t = 20.0)]
    pub pool_rate_limit_qps: f64,

    /// Token-bucket burst for pod create/delete calls
    #[arg(long, env = "POOL_RATE_LIMIT_BURST", default_value_t = 40)]
    pub pool_rate_limit_burst: u32,

    /// Fraction of replicas the locality advisor spreads across, (0, 1]
    #[arg(long, env = "IMAGE_LOCALITY_SPREAD_FACTOR", default_value_t = 0.5)]
    pub image_locality_spread_factor: f64,

    /// Preferred node-affinity weight, [1, 100]
    #[arg(long, env = "IMAGE_LOCALITY_WEIGHT", default_value_t = 50)]
    pub image_locality_weight: i32,

    #[arg(long, env = "ENABLE_MIDDLEWARE", default_value_t = true, action = clap::ArgAction::Set)]
    pub enable_middleware: bool,

    #[arg(long, env = "ENABLE_METRICS", default_value_t = true, action = clap::ArgAction::Set)]
    pub enable_metrics: bool,

    /// Delete workspaces once all their tasks are terminal (unless keepAlive)
    #[arg(long, env = "ENABLE_AUTO_CLEANUP", default_value_t = true, action = clap::ArgAction::Set)]
    pub enable_auto_cleanup: bool,

    #[arg(long, env = "AUDIT_ENABLED", default_value_t = false, action = clap::ArgAction::Set)]
    pub audit_enabled: bool,

    /// Sink coordinates for audit records, e.g. http://audit.arl.svc/v1/records
    #[arg(long, env = "AUDIT_ENDPOINT")]
    pub audit_endpoint: Option<String>,

    /// Port for the /healthz + /metrics exposition server; unset disables it
    #[arg(long, env = "METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Namespace the lease and the controllers operate in
    #[arg(long, env = "NAMESPACE", default_value = "default")]
    pub namespace: String,
}

impl OperatorArgs {
    pub fn validate(&self) -> Result<()> {
        if self.sidecar_http_port == 0 || self.sidecar_grpc_port == 0 {
            bail!("sidecar ports must be non-zero");
        }
        if self.sidecar_http_port == self.sidecar_grpc_port {
            bail!(
                "sidecar HTTP and RPC ports collide on {}",
                self.sidecar_grpc_port
            );
        }
        if self.http_client_timeout_seconds == 0 {
            bail!("--http-client-timeout-seconds must be positive");
        }
        if self.default_pool_replicas < 0 {
            bail!("--default-pool-replicas must be >= 0");
        }
        if self.default_requeue_delay_seconds == 0 || self.workspace_check_interval_seconds == 0 {
            bail!("requeue delays must be positive");
        }
        if self.workspace_idle_timeout_seconds < 0 || self.workspace_max_lifetime_seconds < 0 {
            bail!("workspace timeouts must be >= 0 (0 disables)");
        }
        if self.pool_max_concurrent == 0 || self.workspace_max_concurrent == 0 {
            bail!("max concurrent reconciles must be >= 1");
        }
        if self.pool_base_delay_ms == 0 || self.pool_max_delay_ms < self.pool_base_delay_ms {
            bail!(
                "backoff window [{}ms, {}ms] is not a valid range",
                self.pool_base_delay_ms,
                self.pool_max_delay_ms
            );
        }
        if !(self.pool_rate_limit_qps > 0.0) {
            bail!("--pool-rate-limit-qps must be > 0");
        }
        if self.pool_rate_limit_burst == 0 {
            bail!("--pool-rate-limit-burst must be >= 1");
        }
        if !(self.image_locality_spread_factor > 0.0 && self.image_locality_spread_factor <= 1.0) {
            bail!(
                "--image-locality-spread-factor {} outside (0, 1]",
                self.image_locality_spread_factor
            );
        }
        if !(1..=100).contains(&self.image_locality_weight) {
            bail!(
                "--image-locality-weight {} outside [1, 100]",
                self.image_locality_weight
            );
        }
        if self.audit_enabled && self.audit_endpoint.is_none() {
            bail!("--audit-enabled requires --audit-endpoint");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_from(extra: &[&str]) -> OperatorArgs {
        let mut argv = vec!["arl-operator"];
        argv.extend_from_slice(extra);
        OperatorArgs::parse_from(argv)
    }

    #[test]
    fn defaults_are_valid() {
        args_from(&[]).validate().expect("defaults must validate");
    }

    #[test]
    fn spread_factor_bounds() {
        assert!(
            args_from(&["--image-locality-spread-factor", "0.0"])
                .validate()
                .is_err()
        );
        assert!(
            args_from(&["--image-locality-spread-factor", "1.5"])
                .validate()
                .is_err()
        );
        assert!(
            args_from(&["--image-locality-spread-factor", "1.0"])
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn colliding_sidecar_ports_rejected() {
        let args = args_from(&["--sidecar-http-port", "9090", "--sidecar-grpc-port", "9090"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn audit_requires_endpoint() {
        assert!(args_from(&["--audit-enabled", "true"]).validate().is_err());
        assert!(
            args_from(&[
                "--audit-enabled",
                "true",
                "--audit-endpoint",
                "http://audit.svc/v1"
            ])
            .validate()
            .is_ok()
        );
    }

    #[test]
    fn inverted_backoff_window_rejected() {
        let args = args_from(&["--pool-base-delay-ms", "5000", "--pool-max-delay-ms", "100"]);
        assert!(args.validate().is_err());
    }
}
