//! Subscription filters, the subset of shapes this system uses.

use serde::{Deserialize, Serialize};

use crate::event::Event;

/// A subscription/query filter. Empty fields don't constrain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    /// `p` tag values (destination pubkeys).
    #[serde(rename = "#p", default, skip_serializing_if = "Vec::is_empty")]
    pub p_tags: Vec<String>,
    /// `P` tag values (the user-subject of coordinator acks).
    #[serde(rename = "#P", default, skip_serializing_if = "Vec::is_empty")]
    pub cap_p_tags: Vec<String>,
    /// `e` tag values (session / event references).
    #[serde(rename = "#e", default, skip_serializing_if = "Vec::is_empty")]
    pub e_tags: Vec<String>,
    /// `h` tag values (handler pubkeys).
    #[serde(rename = "#h", default, skip_serializing_if = "Vec::is_empty")]
    pub h_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    pub fn kinds(kinds: impl Into<Vec<u16>>) -> Self {
        Filter {
            kinds: kinds.into(),
            ..Default::default()
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.authors.push(author.into());
        self
    }

    pub fn with_p_tag(mut self, value: impl Into<String>) -> Self {
        self.p_tags.push(value.into());
        self
    }

    pub fn with_cap_p_tag(mut self, value: impl Into<String>) -> Self {
        self.cap_p_tags.push(value.into());
        self
    }

    pub fn with_since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    fn tag_constraint_holds(event: &Event, name: &str, wanted: &[String]) -> bool {
        if wanted.is_empty() {
            return true;
        }
        event
            .tags_named(name)
            .filter_map(|tag| tag.get(1))
            .any(|value| wanted.iter().any(|w| w == value))
    }

    pub fn matches(&self, event: &Event) -> bool {
        if !self.ids.is_empty() && !self.ids.contains(&event.id) {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if !self.authors.is_empty() && !self.authors.contains(&event.pubkey) {
            return false;
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        Self::tag_constraint_holds(event, "p", &self.p_tags)
            && Self::tag_constraint_holds(event, "P", &self.cap_p_tags)
            && Self::tag_constraint_holds(event, "e", &self.e_tags)
            && Self::tag_constraint_holds(event, "h", &self.h_tags)
    }
}
