use crate::error::CoreResult;

/// Opaque blob storage. Keys are chosen by the evidence store; implementations
/// must treat them as plain strings and never infer structure from them.
pub trait ObjectStore: Send + Sync {
    fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> CoreResult<()>;
    fn get(&self, key: &str) -> CoreResult<Vec<u8>>;
    fn public_url(&self, key: &str) -> CoreResult<String>;
    fn delete(&self, key: &str) -> CoreResult<()>;
}

impl<T: ObjectStore + ?Sized> ObjectStore for std::sync::Arc<T> {
    fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> CoreResult<()> {
        (**self).put(key, bytes, content_type)
    }

    fn get(&self, key: &str) -> CoreResult<Vec<u8>> {
        (**self).get(key)
    }

    fn public_url(&self, key: &str) -> CoreResult<String> {
        (**self).public_url(key)
    }

    fn delete(&self, key: &str) -> CoreResult<()> {
        (**self).delete(key)
    }
}
