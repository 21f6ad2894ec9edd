pub mod dispatcher;
pub mod escalation;
pub mod events;
pub mod resolver;
pub mod scheduler;
pub mod self_state;
pub mod sender;
pub mod silencer;
pub mod worker;
