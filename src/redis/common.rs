use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicUsize, Ordering},
    },
};

use redis::{Client, aio::ConnectionManager};

use crate::QuotaBucketError;

/// A pool of [`redis::aio::ConnectionManager`]s handed out round-robin.
///
/// The number of managers bounds how many connections the store holds open.
/// Clones share the same pool; closing one closes all of them.
#[derive(Debug, Clone)]
pub struct QuotaBucketRedisClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    connection_managers: RwLock<Option<Vec<ConnectionManager>>>,
    track_index: AtomicUsize,
    in_flight: AtomicUsize,
}

// ConnectionManager is not Debug
impl fmt::Debug for ClientInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let connection_count = self
            .connection_managers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(Vec::len);

        f.debug_struct("ClientInner")
            .field("connection_count", &connection_count)
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl QuotaBucketRedisClient {
    /// Create a client with a single connection manager.
    pub async fn default_from_client(client: Client) -> Result<Self, QuotaBucketError> {
        Self::from_client(client, 1).await
    }

    /// Create a client holding `connection_count` connection managers.
    pub async fn from_client(
        client: Client,
        connection_count: usize,
    ) -> Result<Self, QuotaBucketError> {
        if connection_count == 0 {
            return Err(QuotaBucketError::InvalidRedisClientConnectionCount(
                "connection count must be > 0".to_string(),
            ));
        }

        let mut connection_managers = Vec::with_capacity(connection_count);

        for _ in 0..connection_count {
            let connection_manager = client
                .get_connection_manager()
                .await
                .map_err(|err| QuotaBucketError::from_redis("failed to connect", err))?;
            connection_managers.push(connection_manager);
        }

        Ok(Self::from_connection_managers(connection_managers))
    }

    /// Wrap an existing connection manager.
    pub fn from_connection_manager(connection_manager: ConnectionManager) -> Self {
        Self::from_connection_managers(vec![connection_manager])
    }

    fn from_connection_managers(connection_managers: Vec<ConnectionManager>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                connection_managers: RwLock::new(Some(connection_managers)),
                track_index: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
            }),
        }
    }

    /// Lease a connection. Fails with [`QuotaBucketError::Stopped`] once the
    /// pool is closed. The lease is released when dropped.
    pub(crate) fn acquire(&self) -> Result<PooledConnection, QuotaBucketError> {
        let guard = self
            .inner
            .connection_managers
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let Some(connection_managers) = guard.as_ref() else {
            return Err(QuotaBucketError::Stopped);
        };

        let index = self.inner.track_index.fetch_add(1, Ordering::Relaxed);
        let connection = connection_managers[index % connection_managers.len()].clone();
        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);

        Ok(PooledConnection {
            connection,
            client: self.inner.clone(),
        })
    } // end method acquire

    /// Number of leases currently held.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Whether the pool has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner
            .connection_managers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Drop every pooled connection manager. Connections close once
    /// outstanding leases are released.
    pub(crate) fn close(&self) {
        let connection_managers = self
            .inner
            .connection_managers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(connection_managers) = connection_managers {
            tracing::debug!(
                count = connection_managers.len(),
                "closed redis connection pool"
            );
        }
    }
} // end impl QuotaBucketRedisClient

/// A connection leased from [`QuotaBucketRedisClient`].
pub(crate) struct PooledConnection {
    connection: ConnectionManager,
    client: Arc<ClientInner>,
}

impl Deref for PooledConnection {
    type Target = ConnectionManager;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.connection
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.client.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A validated caller key.
///
/// This is a string with the following constraints:
/// - Must not be empty
/// - Must not be longer than 512 bytes
#[derive(Debug, Clone, PartialEq, PartialOrd, Hash, Eq)]
pub struct RedisKey(Arc<str>);

impl Deref for RedisKey {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for RedisKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RedisKey {
    type Error = QuotaBucketError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            Err(QuotaBucketError::InvalidRedisKey(
                "Redis key must not be empty".to_string(),
            ))
        } else if value.len() > 512 {
            Err(QuotaBucketError::InvalidRedisKey(
                "Redis key must not be longer than 512 bytes".to_string(),
            ))
        } else {
            Ok(Self(Arc::from(value)))
        }
    }
}

impl TryFrom<&str> for RedisKey {
    type Error = QuotaBucketError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(value.to_string())
    }
}

/// A namespace prepended to every stored key as `<prefix>:<key>`.
///
/// This is a string with the following constraints:
/// - Must not be empty
/// - Must not be longer than 255 bytes
/// - Must not contain colons
#[derive(Debug, Clone, PartialEq, PartialOrd, Hash, Eq)]
pub struct KeyPrefix(Arc<str>);

impl Deref for KeyPrefix {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<String> for KeyPrefix {
    type Error = QuotaBucketError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            Err(QuotaBucketError::InvalidKeyPrefix(
                "Key prefix must not be empty".to_string(),
            ))
        } else if value.len() > 255 {
            Err(QuotaBucketError::InvalidKeyPrefix(
                "Key prefix must not be longer than 255 bytes".to_string(),
            ))
        } else if value.contains(':') {
            Err(QuotaBucketError::InvalidKeyPrefix(
                "Key prefix must not contain colons".to_string(),
            ))
        } else {
            Ok(Self(Arc::from(value)))
        }
    }
}

impl TryFrom<&str> for KeyPrefix {
    type Error = QuotaBucketError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(value.to_string())
    }
}

/// Maps caller keys to stored Redis keys.
#[derive(Debug, Clone, Default)]
pub(crate) struct RedisKeyGenerator {
    prefix: Option<KeyPrefix>,
}

impl RedisKeyGenerator {
    pub(crate) fn new(prefix: Option<KeyPrefix>) -> Self {
        Self { prefix }
    }

    pub(crate) fn get_bucket_key(&self, key: &RedisKey) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}:{}", &**prefix, &**key),
            None => key.to_string(),
        }
    }
}
