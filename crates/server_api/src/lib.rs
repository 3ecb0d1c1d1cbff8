use shared::{
    domain::{RoomId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{MessagePayload, RoomSummary},
};
use storage::{Storage, StoredMessage};
use tracing::debug;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

/// Creates a message on behalf of `sender_id` and returns the stored payload
/// the caller publishes to the room's subscribers.
pub async fn send_message(
    ctx: &ApiContext,
    sender_id: UserId,
    receiver_id: UserId,
    body: &str,
) -> Result<MessagePayload, ApiError> {
    if body.trim().is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "message body cannot be empty",
        ));
    }
    if receiver_id.0 <= 0 {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "receiver id is missing",
        ));
    }
    if sender_id == receiver_id {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "sender and receiver must differ",
        ));
    }
    ctx.storage
        .display_name_for_user(receiver_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "receiver not found"))?;

    let stored = ctx
        .storage
        .append_message(sender_id, receiver_id, body)
        .await
        .map_err(internal)?;
    debug!(
        message_id = stored.message_id.0,
        room_id = %stored.room_id,
        "message stored"
    );
    Ok(payload_from(stored))
}

/// Full room history, ascending. Callers must be one of the two
/// participants encoded in the room id.
pub async fn list_messages(
    ctx: &ApiContext,
    caller_id: UserId,
    room_id: &RoomId,
) -> Result<Vec<MessagePayload>, ApiError> {
    ensure_participant(room_id, caller_id)?;
    let messages = ctx
        .storage
        .list_room_messages(room_id)
        .await
        .map_err(internal)?;
    Ok(messages.into_iter().map(payload_from).collect())
}

pub async fn mark_read(
    ctx: &ApiContext,
    caller_id: UserId,
    room_id: &RoomId,
) -> Result<u64, ApiError> {
    ensure_participant(room_id, caller_id)?;
    ctx.storage
        .mark_room_read(room_id, caller_id)
        .await
        .map_err(internal)
}

pub async fn clear_room(
    ctx: &ApiContext,
    caller_id: UserId,
    room_id: &RoomId,
) -> Result<u64, ApiError> {
    ensure_participant(room_id, caller_id)?;
    let deleted = ctx.storage.clear_room(room_id).await.map_err(internal)?;
    debug!(room_id = %room_id, deleted, "room cleared");
    Ok(deleted)
}

/// The caller's chat list: one summary per room they participate in,
/// newest last message first.
pub async fn list_rooms(ctx: &ApiContext, caller_id: UserId) -> Result<Vec<RoomSummary>, ApiError> {
    let rows = ctx
        .storage
        .list_active_rooms_for_user(caller_id)
        .await
        .map_err(internal)?;

    let mut summaries = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(counterparty_id) = row.last_message.room_id.counterparty(caller_id) else {
            // a row the caller does not participate in means the store and
            // the room id derivation disagree; skip rather than mislabel
            continue;
        };
        summaries.push(RoomSummary {
            room_id: row.last_message.room_id.clone(),
            counterparty_id,
            last_message: payload_from(row.last_message),
            unread_count: row.unread_count,
        });
    }
    Ok(summaries)
}

/// Rejects callers that are not one of the two participants of the room.
/// Malformed room ids are a validation error, not an authorization one.
pub fn ensure_participant(room_id: &RoomId, caller_id: UserId) -> Result<(), ApiError> {
    if room_id.participants().is_none() {
        return Err(ApiError::new(ErrorCode::Validation, "malformed room id"));
    }
    if !room_id.has_participant(caller_id) {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "caller is not a participant of this room",
        ));
    }
    Ok(())
}

pub fn payload_from(stored: StoredMessage) -> MessagePayload {
    MessagePayload {
        message_id: stored.message_id,
        room_id: stored.room_id,
        sender_id: stored.sender_id,
        receiver_id: stored.receiver_id,
        body: stored.body,
        sent_at: stored.sent_at,
        read_at: stored.read_at,
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
