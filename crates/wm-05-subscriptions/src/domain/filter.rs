//! Compiled subscription filters.
//!
//! Filters are regular expressions compiled once at subscription creation
//! (bad patterns are rejected up front) and matched per event. Empty fields
//! match everything. All populated fields must match for an event to be
//! dispatched.

use regex::Regex;
use shared_types::SubscriptionFilter;

use crate::error::SubscriptionError;
use crate::ports::transport::EnrichedEvent;

fn compile(field: &'static str, pattern: &str) -> Result<Option<Regex>, SubscriptionError> {
    if pattern.is_empty() {
        return Ok(None);
    }
    Regex::new(pattern)
        .map(Some)
        .map_err(|e| SubscriptionError::BadFilter {
            field,
            message: e.to_string(),
        })
}

fn matches(filter: &Option<Regex>, value: &str) -> bool {
    filter.as_ref().map_or(true, |re| re.is_match(value))
}

/// A subscription filter with all regular expressions pre-compiled.
#[derive(Debug)]
pub struct CompiledFilter {
    events: Option<Regex>,
    topic: Option<Regex>,
    message_tag: Option<Regex>,
    message_group: Option<Regex>,
    message_author: Option<Regex>,
    tx_type: Option<Regex>,
    blockchain_name: Option<Regex>,
    blockchain_listener: Option<Regex>,
}

impl CompiledFilter {
    /// Compile every populated field, failing on the first bad pattern.
    pub fn compile(filter: &SubscriptionFilter) -> Result<Self, SubscriptionError> {
        Ok(CompiledFilter {
            events: compile("events", &filter.events)?,
            topic: compile("topic", &filter.topic)?,
            message_tag: compile("message.tag", &filter.message.tag)?,
            message_group: compile("message.group", &filter.message.group)?,
            message_author: compile("message.author", &filter.message.author)?,
            tx_type: compile("transaction.type", &filter.transaction.tx_type)?,
            blockchain_name: compile("blockchainevent.name", &filter.blockchain_event.name)?,
            blockchain_listener: compile(
                "blockchainevent.listener",
                &filter.blockchain_event.listener,
            )?,
        })
    }

    /// Whether an enriched event passes every populated field.
    #[must_use]
    pub fn matches(&self, enriched: &EnrichedEvent) -> bool {
        let event = &enriched.event;
        let event_type = serde_json::to_value(event.event_type)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        if !matches(&self.events, &event_type) {
            return false;
        }
        if !matches(&self.topic, event.topic.as_deref().unwrap_or_default()) {
            return false;
        }

        if self.message_tag.is_some()
            || self.message_group.is_some()
            || self.message_author.is_some()
        {
            let Some(message) = &enriched.message else {
                return false;
            };
            let group = message
                .header
                .group
                .map(|g| g.to_string())
                .unwrap_or_default();
            if !matches(&self.message_tag, message.header.tag.as_deref().unwrap_or_default())
                || !matches(&self.message_group, &group)
                || !matches(&self.message_author, &message.header.signer.author)
            {
                return false;
            }
        }

        if let Some(tx_filter) = &self.tx_type {
            let Some(tx) = &enriched.transaction else {
                return false;
            };
            let tx_type = serde_json::to_value(tx.tx_type)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            if !tx_filter.is_match(&tx_type) {
                return false;
            }
        }

        if self.blockchain_name.is_some() || self.blockchain_listener.is_some() {
            let Some(chain_event) = &enriched.blockchain_event else {
                return false;
            };
            let listener = chain_event
                .listener
                .map(|l| l.to_string())
                .unwrap_or_default();
            if !matches(&self.blockchain_name, &chain_event.name)
                || !matches(&self.blockchain_listener, &listener)
            {
                return false;
            }
        }

        true
    }
}
