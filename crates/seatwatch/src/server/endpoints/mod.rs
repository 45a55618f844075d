pub mod status;
pub mod terms;
pub mod watch;
