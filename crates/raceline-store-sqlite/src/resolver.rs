//! Get-or-create resolution of participants, handlers and operators.
//!
//! Dimension rows are written once and never updated; the first name seen for
//! an identifier wins. Callers pass the open load transaction so a rejected
//! bundle also rolls back the entities it created.

use anyhow::{Context, Result};
use raceline_core::{DimensionKind, EntityRef, ParticipantRef, RacelineError};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resolution {
    pub kind: DimensionKind,
    pub entity_id: String,
    pub created: bool,
}

fn dimension_table(kind: DimensionKind) -> (&'static str, &'static str) {
    match kind {
        DimensionKind::Participant => ("participants", "participant_id"),
        DimensionKind::Handler => ("handlers", "handler_id"),
        DimensionKind::Operator => ("operators", "operator_id"),
    }
}

fn entity_exists(conn: &Connection, kind: DimensionKind, entity_id: &str) -> Result<bool> {
    let (table, id_column) = dimension_table(kind);
    let found = conn
        .query_row(
            &format!("SELECT 1 FROM {table} WHERE {id_column} = ?1"),
            params![entity_id],
            |_| Ok(()),
        )
        .optional()
        .with_context(|| format!("failed to look up {kind} {entity_id}"))?;
    Ok(found.is_some())
}

fn required_id(kind: DimensionKind, raw: &str) -> Result<String, RacelineError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(RacelineError::Reference(format!("{kind} id is blank")));
    }
    Ok(trimmed.to_string())
}

fn required_name(kind: DimensionKind, entity_id: &str, name: Option<&str>) -> Result<String, RacelineError> {
    match name.map(str::trim) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(RacelineError::Reference(format!(
            "{kind} {entity_id} is unknown and no name was extracted"
        ))),
    }
}

pub fn resolve_participant(conn: &Connection, participant: &ParticipantRef, created_at: &str) -> Result<Resolution> {
    let kind = DimensionKind::Participant;
    let entity_id = required_id(kind, &participant.id)?;
    if entity_exists(conn, kind, &entity_id)? {
        return Ok(Resolution {
            kind,
            entity_id,
            created: false,
        });
    }

    let name = required_name(kind, &entity_id, participant.name.as_deref())?;
    conn.execute(
        "INSERT INTO participants(participant_id, name, sex, birth_year, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![entity_id, name, participant.sex, participant.birth_year, created_at],
    )
    .with_context(|| format!("failed to create participant {entity_id}"))?;

    Ok(Resolution {
        kind,
        entity_id,
        created: true,
    })
}

/// Resolves a handler or operator reference.
pub fn resolve_agent(conn: &Connection, kind: DimensionKind, agent: &EntityRef, created_at: &str) -> Result<Resolution> {
    if kind == DimensionKind::Participant {
        return Err(RacelineError::Reference(
            "participants are resolved through resolve_participant".to_string(),
        )
        .into());
    }

    let entity_id = required_id(kind, &agent.id)?;
    if entity_exists(conn, kind, &entity_id)? {
        return Ok(Resolution {
            kind,
            entity_id,
            created: false,
        });
    }

    let name = required_name(kind, &entity_id, agent.name.as_deref())?;
    let (table, id_column) = dimension_table(kind);
    conn.execute(
        &format!("INSERT INTO {table}({id_column}, name, created_at) VALUES (?1, ?2, ?3)"),
        params![entity_id, name, created_at],
    )
    .with_context(|| format!("failed to create {kind} {entity_id}"))?;

    Ok(Resolution {
        kind,
        entity_id,
        created: true,
    })
}
