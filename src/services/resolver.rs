//! Expansion of contact macros into concrete destinations.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::{
    clients::traits::Database,
    models::{
        contact::{ContactData, ResolvedContact},
        event::NotificationEvent,
    },
};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResolveError {
    #[error("nobody is on duty for schedule {0}")]
    NobodyOnDuty(String),

    #[error("no deployers found and no fallback value")]
    NoDeployers,

    #[error("contact group {0} is empty and has no fallback value")]
    EmptyGroup(String),

    #[error("no {0} service channels found and no fallback value")]
    NoServiceChannels(String),

    #[error("contact lookup failed: {0}")]
    Lookup(String),
}

impl ResolveError {
    /// Duty rotations change over time, the other failures will not fix
    /// themselves for this package.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ResolveError::NobodyOnDuty(_) | ResolveError::Lookup(_))
    }
}

#[async_trait]
pub trait ContactResolver: Send + Sync {
    async fn unwrap_contact(
        &self,
        contact: &ContactData,
        events: &[NotificationEvent],
    ) -> Result<Vec<ResolvedContact>, ResolveError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ContactMacro<'a> {
    Duty(&'a str),
    Deployers,
    Service(&'a str),
    Group(&'a str),
    Literal,
}

impl<'a> ContactMacro<'a> {
    pub fn parse(value: &'a str) -> Self {
        let Some(body) = value
            .strip_prefix("${")
            .and_then(|rest| rest.strip_suffix('}'))
        else {
            return ContactMacro::Literal;
        };

        match body.split_once(':') {
            Some(("duty", schedule)) if !schedule.is_empty() => ContactMacro::Duty(schedule),
            Some(("service", kind)) if !kind.is_empty() => ContactMacro::Service(kind),
            Some(("group", name)) if !name.is_empty() => ContactMacro::Group(name),
            None if body == "deployers" => ContactMacro::Deployers,
            _ => ContactMacro::Literal,
        }
    }
}

/// Resolves macros against event context and the lookup data kept in the
/// store.
pub struct MacroResolver {
    database: Arc<dyn Database>,
}

impl MacroResolver {
    pub fn new(database: Arc<dyn Database>) -> Self {
        Self { database }
    }

    async fn resolve_duty(
        &self,
        contact: &ContactData,
        schedule: &str,
    ) -> Result<Vec<ResolvedContact>, ResolveError> {
        let duty = self
            .database
            .get_duty(schedule)
            .await
            .map_err(|e| ResolveError::Lookup(e.to_string()))?
            .unwrap_or_default();

        if duty.persons.is_empty() {
            return Err(ResolveError::NobodyOnDuty(schedule.to_string()));
        }

        Ok(duty
            .persons
            .into_iter()
            .map(|person| ResolvedContact {
                replaced_value: person,
                rollback_value: contact.value.clone(),
                expiration: duty.until,
            })
            .collect())
    }

    async fn resolve_group(
        &self,
        contact: &ContactData,
        group: &str,
    ) -> Result<Vec<ResolvedContact>, ResolveError> {
        let members = self
            .database
            .get_group_members(group)
            .await
            .map_err(|e| ResolveError::Lookup(e.to_string()))?;

        expand(contact, members)
            .or_else(|| fallback(contact))
            .ok_or_else(|| ResolveError::EmptyGroup(group.to_string()))
    }
}

fn expand(contact: &ContactData, values: Vec<String>) -> Option<Vec<ResolvedContact>> {
    if values.is_empty() {
        return None;
    }

    Some(
        values
            .into_iter()
            .map(|value| ResolvedContact {
                replaced_value: value,
                rollback_value: contact.value.clone(),
                expiration: contact.expiration,
            })
            .collect(),
    )
}

fn fallback(contact: &ContactData) -> Option<Vec<ResolvedContact>> {
    let value = contact.fallback_value.as_ref().filter(|v| !v.is_empty())?;

    Some(vec![ResolvedContact {
        replaced_value: value.clone(),
        rollback_value: contact.value.clone(),
        expiration: contact.expiration,
    }])
}

fn collect_unique<'a>(values: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut unique: Vec<String> = Vec::new();
    for value in values {
        if !unique.contains(value) {
            unique.push(value.clone());
        }
    }
    unique
}

#[async_trait]
impl ContactResolver for MacroResolver {
    async fn unwrap_contact(
        &self,
        contact: &ContactData,
        events: &[NotificationEvent],
    ) -> Result<Vec<ResolvedContact>, ResolveError> {
        let contact_macro = ContactMacro::parse(&contact.value);
        debug!(contact_id = %contact.id, ?contact_macro, "Resolving contact");

        match contact_macro {
            ContactMacro::Literal => Ok(vec![ResolvedContact {
                expiration: contact.expiration,
                ..ResolvedContact::literal(&contact.value)
            }]),
            ContactMacro::Duty(schedule) => self.resolve_duty(contact, schedule).await,
            ContactMacro::Group(group) => self.resolve_group(contact, group).await,
            ContactMacro::Deployers => {
                let deployers =
                    collect_unique(events.iter().flat_map(|e| e.context.deployers.iter()));

                expand(contact, deployers)
                    .or_else(|| fallback(contact))
                    .ok_or(ResolveError::NoDeployers)
            }
            ContactMacro::Service(kind) => {
                let channels = collect_unique(
                    events
                        .iter()
                        .filter_map(|e| e.context.service_channels.get(kind))
                        .flatten(),
                );

                expand(contact, channels)
                    .or_else(|| fallback(contact))
                    .ok_or_else(|| ResolveError::NoServiceChannels(kind.to_string()))
            }
        }
    }
}
