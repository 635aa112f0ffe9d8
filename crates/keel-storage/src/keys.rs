use keel_types::KeelError;

/// Separates collection from id in the document namespace.
pub const KEY_SEPARATOR: char = ':';

/// `documents` partition: `"{collection}:{id}"` as UTF-8.
pub fn document_key(collection: &str, id: &str) -> String {
    let mut key = String::with_capacity(collection.len() + 1 + id.len());
    key.push_str(collection);
    key.push(KEY_SEPARATOR);
    key.push_str(id);
    key
}

/// Prefix covering every document of `collection`: `"{collection}:"`.
///
/// The trailing separator keeps a scan of "job" from matching "jobs:…".
pub fn collection_prefix(collection: &str) -> String {
    let mut prefix = String::with_capacity(collection.len() + 1);
    prefix.push_str(collection);
    prefix.push(KEY_SEPARATOR);
    prefix
}

/// Split a document key back into `(collection, id)`.
pub fn split_document_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(KEY_SEPARATOR)
}

/// Reject names that would make `"{collection}:{id}"` ambiguous.
pub fn validate(collection: &str, id: &str) -> Result<(), KeelError> {
    validate_collection(collection)?;
    if id.is_empty() {
        return Err(KeelError::InvalidArgument("document id must not be empty".into()));
    }
    Ok(())
}

pub fn validate_collection(collection: &str) -> Result<(), KeelError> {
    if collection.is_empty() {
        return Err(KeelError::InvalidArgument("collection must not be empty".into()));
    }
    if collection.contains(KEY_SEPARATOR) {
        return Err(KeelError::InvalidArgument(format!(
            "collection '{collection}' must not contain '{KEY_SEPARATOR}'"
        )));
    }
    Ok(())
}

/// `raft_log` partition: `index(8)` big-endian, so lexicographic order is
/// numeric order.
pub fn raft_log_key(index: u64) -> [u8; 8] {
    index.to_be_bytes()
}

/// Recover the index from a `raft_log` key.
pub fn raft_log_index(key: &[u8]) -> Result<u64, KeelError> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| KeelError::Io("short raft_log key".into()))?;
    Ok(u64::from_be_bytes(bytes))
}

/// `meta` partition: label as UTF-8.
pub fn meta_key(label: &str) -> Vec<u8> {
    label.as_bytes().to_vec()
}
