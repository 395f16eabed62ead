pub mod args;
pub mod metrics;
pub mod shutdown;
pub mod wait;

/// Process-wide setup every ARL binary runs first: color handling has to be
/// decided before anything logs.
pub fn init() {
    let no_color = std::env::var_os("NO_COLOR").is_some()
        || std::env::var("DISABLE_COLORS")
            .is_ok_and(|v| matches!(v.to_lowercase().as_str(), "1" | "true"));
    owo_colors::set_override(!no_color);
}

/// Touches the readiness file the deployment's exec probe checks. An
/// unwritable filesystem is logged, not fatal; the controllers can still do
/// useful work without the probe.
pub fn signal_ready() {
    const READY_FILE: &str = "/etc/arl-ready";
    if let Err(e) = std::fs::write(READY_FILE, b"ok") {
        eprintln!("could not write readiness file {READY_FILE}: {e}");
    }
}

/// Pod labels forming the sole index between the controllers. The allocator's
/// `idle -> allocated` swap on `STATUS` is the claim primitive; nothing else
/// coordinates the pool maintainer and the workspace allocator.
pub mod labels {
    /// Owning Pool name.
    pub const POOL: &str = "pool";
    /// `idle` or `allocated`.
    pub const STATUS: &str = "status";
    /// Owning Workspace name, present only while allocated.
    pub const WORKSPACE: &str = "workspace";

    pub const STATUS_IDLE: &str = "idle";
    pub const STATUS_ALLOCATED: &str = "allocated";

    /// Labels reserved for the operator; user template labels shadowing
    /// these are dropped.
    pub const RESERVED: &[&str] = &[POOL, STATUS, WORKSPACE];
}

pub mod annotations {
    pub const CREATED_BY: &str = "arl.dev/created-by";
    pub const SPEC_HASH: &str = "arl.dev/spec-hash";
}

/// Present on every Workspace from first observation until release completes.
pub const WORKSPACE_FINALIZER: &str = "workspace-finalizer";
