//! Ticket ID resolution: commands accept either the ticket's UUID or its
//! external tracker ID.

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

use conductor_db::models::Ticket;
use conductor_db::queries::tickets as ticket_db;

/// Resolve a user-supplied identifier to a ticket.
///
/// A parseable UUID is looked up by primary key first, falling back to the
/// external ID either way.
pub async fn resolve_ticket(pool: &PgPool, ident: &str) -> Result<Option<Ticket>> {
    if let Ok(id) = Uuid::parse_str(ident) {
        if let Some(ticket) = ticket_db::get_ticket(pool, id).await? {
            return Ok(Some(ticket));
        }
    }
    ticket_db::get_ticket_by_external_id(pool, ident).await
}
