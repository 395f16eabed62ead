pub mod reconcile;
pub mod steps;
pub mod ttl;

pub use reconcile::run;
pub use ttl::run_reaper;
