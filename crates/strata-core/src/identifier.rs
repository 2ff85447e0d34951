// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resolution of user-supplied node identifiers.
//!
//! A string is interpreted with fixed precedence:
//!
//! 1. a trailing [`LABEL_ESCAPE`] forces a label (the escape is stripped),
//! 2. all digits is a primary key,
//! 3. hex digits once dashes are removed is a UUID prefix,
//! 4. anything else is a label.
//!
//! So `"5"` is pk 5 even when a node is labelled `"5"`, and `"5!"` is that
//! label.

use std::fmt;

use crate::error::StoreError;
use crate::node::{Node, NodeFilter, NodeId, PROCESS_NODE_TYPE, Pk};
use crate::persistence::NodeStore;

/// Suffix that forces label interpretation.
pub const LABEL_ESCAPE: char = '!';

const UUID_HEX_LEN: usize = 32;

/// How an identifier string was interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identifier {
    /// Primary key.
    Pk(Pk),
    /// Lowercase hex prefix of the dash-stripped UUID.
    UuidPrefix(String),
    /// Exact label.
    Label(String),
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Pk(pk) => write!(f, "pk {pk}"),
            Identifier::UuidPrefix(prefix) => write!(f, "uuid {prefix}"),
            Identifier::Label(label) => write!(f, "label '{label}'"),
        }
    }
}

/// Interpret `raw`.
pub fn parse_identifier(raw: &str) -> Identifier {
    if let Some(label) = raw.strip_suffix(LABEL_ESCAPE) {
        return Identifier::Label(label.to_string());
    }
    if !raw.is_empty()
        && raw.bytes().all(|b| b.is_ascii_digit())
        && let Ok(pk) = raw.parse::<Pk>()
    {
        return Identifier::Pk(pk);
    }

    let hex: String = raw.chars().filter(|c| *c != '-').collect();
    if !hex.is_empty() && hex.len() <= UUID_HEX_LEN && hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Identifier::UuidPrefix(hex.to_ascii_lowercase());
    }
    Identifier::Label(raw.to_string())
}

/// Load the single node `raw` identifies.
///
/// `node_type_prefix` restricts the candidates, e.g. to process records.
/// No match is `NotExistent`; several are `MultipleObjects`.
pub async fn resolve_identifier(
    store: &dyn NodeStore,
    raw: &str,
    node_type_prefix: Option<&str>,
) -> Result<Node, StoreError> {
    let identifier = parse_identifier(raw);
    let not_found = || StoreError::NotExistent {
        entity: "node",
        identifier: identifier.to_string(),
    };

    let filter = match &identifier {
        Identifier::Pk(pk) => {
            let node = store.load_node(NodeId::Pk(*pk)).await?;
            if node_type_prefix.is_some_and(|prefix| !node.node_type.starts_with(prefix)) {
                return Err(not_found());
            }
            return Ok(node);
        }
        Identifier::UuidPrefix(prefix) => NodeFilter::new().uuid_prefix(prefix.as_str()),
        Identifier::Label(label) => NodeFilter::new().label(label.as_str()),
    };
    let filter = match node_type_prefix {
        Some(prefix) => filter.node_type_prefix(prefix),
        None => filter,
    };

    let mut matches = store.query(&filter.limit(2)).await?;
    match matches.len() {
        0 => Err(not_found()),
        1 => matches.pop().ok_or_else(not_found),
        _ => Err(StoreError::MultipleObjects {
            entity: "node",
            identifier: identifier.to_string(),
        }),
    }
}

/// Load the process record `raw` identifies.
pub async fn resolve_process(store: &dyn NodeStore, raw: &str) -> Result<Node, StoreError> {
    resolve_identifier(store, raw, Some(PROCESS_NODE_TYPE)).await
}
