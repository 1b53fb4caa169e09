/*!
 * @file codec/message.rs
 * @brief Wire message builder (component B)
 *
 * Builds OP_QUERY/OP_INSERT/OP_UPDATE/OP_DELETE/OP_KILL_CURSORS/OP_GET_MORE
 * request frames. Every frame begins with the standard 16-byte header
 * (`messageLength`, `requestID`, `responseTo`, `opcode`), little-endian,
 * with `messageLength` counting the whole frame.
 */

use crate::codec::pack::{pack_append, PackArg};
use crate::error::{MongoError, Result};
use crate::wire::{DeleteFlags, InsertFlags, OpCode, QueryFlags, UpdateFlags};

fn validate_name(part: &str, what: &str) -> Result<()> {
    if part.is_empty() {
        return Err(MongoError::Format(format!("{what} must not be empty")));
    }
    if part.as_bytes().contains(&0) {
        return Err(MongoError::Format(format!(
            "{what} must not contain a NUL byte"
        )));
    }
    Ok(())
}

fn full_collection_name(db: &str, col: &str) -> Result<String> {
    validate_name(db, "database name")?;
    validate_name(col, "collection name")?;
    Ok(format!("{db}.{col}"))
}

/// Wraps a fully-built body in the standard header. `messageLength` counts
/// the header too.
fn finish_frame(request_id: i32, opcode: OpCode, body: Vec<u8>) -> Vec<u8> {
    let message_length = (16 + body.len()) as u32;
    let mut frame = pack_append(
        "<iiii",
        &[
            PackArg::U32(message_length),
            PackArg::U32(request_id as u32),
            PackArg::U32(0), // responseTo is always 0 on requests
            PackArg::U32(opcode as i32 as u32),
        ],
    );
    frame.extend_from_slice(&body);
    frame
}

/// OP_QUERY: `flags; fullCollectionName; numberToSkip; numberToReturn;
/// query; [returnFieldsSelector]`.
pub fn build_query(
    request_id: i32,
    flags: QueryFlags,
    db: &str,
    col: &str,
    number_to_skip: i32,
    number_to_return: i32,
    query: &[u8],
    return_fields_selector: Option<&[u8]>,
) -> Result<Vec<u8>> {
    let full_name = full_collection_name(db, col)?;
    let mut body = pack_append(
        "<iS",
        &[PackArg::U32(flags.bits() as u32), PackArg::StrZ(&full_name)],
    );
    body.extend_from_slice(&pack_append(
        "<ii",
        &[
            PackArg::U32(number_to_skip as u32),
            PackArg::U32(number_to_return as u32),
        ],
    ));
    body.extend_from_slice(query);
    if let Some(rfs) = return_fields_selector {
        body.extend_from_slice(rfs);
    }
    Ok(finish_frame(request_id, OpCode::Query, body))
}

/// OP_INSERT: `flags; fullCollectionName; one or more BSON documents`.
pub fn build_insert(
    request_id: i32,
    flags: InsertFlags,
    db: &str,
    col: &str,
    docs: &[&[u8]],
) -> Result<Vec<u8>> {
    let full_name = full_collection_name(db, col)?;
    if docs.is_empty() {
        return Err(MongoError::Format(
            "OP_INSERT requires at least one document".into(),
        ));
    }
    let mut body = pack_append(
        "<iS",
        &[PackArg::U32(flags.bits() as u32), PackArg::StrZ(&full_name)],
    );
    for doc in docs {
        body.extend_from_slice(doc);
    }
    Ok(finish_frame(request_id, OpCode::Insert, body))
}

/// OP_UPDATE: `ZERO; fullCollectionName; flags; selector; update`.
pub fn build_update(
    request_id: i32,
    db: &str,
    col: &str,
    flags: UpdateFlags,
    selector: &[u8],
    update: &[u8],
) -> Result<Vec<u8>> {
    let full_name = full_collection_name(db, col)?;
    let mut body = pack_append("<iS", &[PackArg::U32(0), PackArg::StrZ(&full_name)]);
    body.extend_from_slice(&pack_append("<i", &[PackArg::U32(flags.bits() as u32)]));
    body.extend_from_slice(selector);
    body.extend_from_slice(update);
    Ok(finish_frame(request_id, OpCode::Update, body))
}

/// OP_DELETE: `ZERO; fullCollectionName; flags; selector`.
pub fn build_delete(
    request_id: i32,
    db: &str,
    col: &str,
    flags: DeleteFlags,
    selector: &[u8],
) -> Result<Vec<u8>> {
    let full_name = full_collection_name(db, col)?;
    let mut body = pack_append("<iS", &[PackArg::U32(0), PackArg::StrZ(&full_name)]);
    body.extend_from_slice(&pack_append("<i", &[PackArg::U32(flags.bits() as u32)]));
    body.extend_from_slice(selector);
    Ok(finish_frame(request_id, OpCode::Delete, body))
}

/// OP_KILL_CURSORS: `ZERO; numberOfCursorIDs; cursorIDs[]`.
pub fn build_kill_cursors(request_id: i32, cursor_ids: &[i64]) -> Result<Vec<u8>> {
    let mut body = pack_append(
        "<ii",
        &[PackArg::U32(0), PackArg::U32(cursor_ids.len() as u32)],
    );
    for id in cursor_ids {
        body.extend_from_slice(&pack_append("<q", &[PackArg::U64(*id as u64)]));
    }
    Ok(finish_frame(request_id, OpCode::KillCursors, body))
}

/// OP_GET_MORE: `ZERO; fullCollectionName; numberToReturn; cursorID`.
pub fn build_get_more(
    request_id: i32,
    db: &str,
    col: &str,
    number_to_return: i32,
    cursor_id: i64,
) -> Result<Vec<u8>> {
    let full_name = full_collection_name(db, col)?;
    let mut body = pack_append("<iS", &[PackArg::U32(0), PackArg::StrZ(&full_name)]);
    body.extend_from_slice(&pack_append(
        "<iq",
        &[
            PackArg::U32(number_to_return as u32),
            PackArg::U64(cursor_id as u64),
        ],
    ));
    Ok(finish_frame(request_id, OpCode::GetMore, body))
}

/// Synthesizes `{ getLastError: 1 }` as an OP_QUERY on `db.$cmd`, used by
/// write operations (insert/update/delete/kill_cursors) to obtain a reply
/// when the caller supplied a callback — those opcodes have no OP_REPLY
/// of their own on the wire.
pub fn build_get_last_error(request_id: i32, db: &str) -> Result<Vec<u8>> {
    let query = bson::to_vec(&bson::doc! { "getLastError": 1 })
        .map_err(|e| MongoError::Format(format!("failed to encode getLastError: {e}")))?;
    build_query(request_id, QueryFlags::empty(), db, "$cmd", 0, -1, &query, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_frame_has_correct_header_and_layout() {
        let query = bson::to_vec(&bson::doc! { "ping": 1 }).unwrap();
        let frame = build_query(7, QueryFlags::SLAVE_OK, "test", "things", 0, 100, &query, None).unwrap();

        let message_length = u32::from_le_bytes(frame[0..4].try_into().unwrap());
        let request_id = i32::from_le_bytes(frame[4..8].try_into().unwrap());
        let response_to = i32::from_le_bytes(frame[8..12].try_into().unwrap());
        let opcode = i32::from_le_bytes(frame[12..16].try_into().unwrap());

        assert_eq!(message_length as usize, frame.len());
        assert_eq!(request_id, 7);
        assert_eq!(response_to, 0);
        assert_eq!(opcode, OpCode::Query as i32);

        let flags = i32::from_le_bytes(frame[16..20].try_into().unwrap());
        assert_eq!(flags, QueryFlags::SLAVE_OK.bits());

        let name_end = frame[20..].iter().position(|&b| b == 0).unwrap() + 20;
        assert_eq!(&frame[20..name_end], b"test.things");
    }

    #[test]
    fn empty_collection_name_is_rejected() {
        let query = bson::to_vec(&bson::doc! {}).unwrap();
        let err = build_query(1, QueryFlags::empty(), "test", "", 0, 0, &query, None).unwrap_err();
        assert!(matches!(err, MongoError::Format(_)));
    }

    #[test]
    fn insert_requires_at_least_one_document() {
        let err = build_insert(1, InsertFlags::empty(), "db", "col", &[]).unwrap_err();
        assert!(matches!(err, MongoError::Format(_)));
    }

    #[test]
    fn get_last_error_targets_cmd_collection() {
        let frame = build_get_last_error(2, "mydb").unwrap();
        let name_end = frame[20..].iter().position(|&b| b == 0).unwrap() + 20;
        assert_eq!(&frame[20..name_end], b"mydb.$cmd");
    }
}
