pub mod check;
pub mod contact;
pub mod escalation;
pub mod event;
pub mod health;
pub mod notification;
pub mod package;
pub mod retry;
pub mod status;
pub mod subscription;
pub mod trigger;
