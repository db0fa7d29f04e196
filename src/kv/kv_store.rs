//! The `KVStore`
use crate::config::CacheConfig;
use crate::error::LiquidError;
use crate::kv::{KVMessage, Key, MemPersist, Persist, Value};
use crate::network::{Membership, Network};
use crate::node::NodeMsg;
use bincode::{deserialize, serialize};
use deepsize::DeepSizeOf;
use log::{debug, error, info};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use sysinfo::System;
use tokio::sync::oneshot;

const BYTES_PER_GB: f64 = 1_073_741_824.0;

/// A distributed `Key`, `Value` store. See the [module level
/// documentation](crate::kv) for how keys are owned and fetched.
#[derive(Debug)]
pub struct KVStore {
    /// The `id` of the node this `KVStore` is running on
    pub(crate) id: usize,
    /// The values owned by this `KVStore`
    data: RwLock<HashMap<Key, Value>>,
    /// Owned keys whose values were paged out to `persist`
    spilled: RwLock<HashSet<Key>>,
    /// An `LRU` cache of values owned by other nodes
    cache: Mutex<Cache>,
    /// The total deep size (in bytes) of values this `KVStore` is allowed to
    /// keep in its cache
    max_cache_size: u64,
    /// The `network` layer, used to send and receive messages and data with
    /// other `KVStore`s
    network: Arc<Network<NodeMsg>>,
    /// Callers waiting for a reply, by request id
    pending: Mutex<HashMap<usize, oneshot::Sender<KVMessage>>>,
    next_req_id: AtomicUsize,
    persist: Arc<dyn Persist>,
}

#[derive(Debug)]
struct Cache {
    /// Values and their deep sizes
    lru: LruCache<Key, (Value, u64)>,
    size: u64,
}

impl Cache {
    fn get(&mut self, key: &Key) -> Option<Value> {
        self.lru.get(key).map(|(v, _)| v.clone())
    }

    fn pop(&mut self, key: &Key) {
        if let Some((_, size)) = self.lru.pop(key) {
            self.size -= size;
        }
    }
}

impl KVStore {
    /// Creates a new `KVStore` that talks to other nodes over `network`.
    /// Values are paged out to memory until a backend is set with
    /// [`with_persist`](KVStore::with_persist).
    pub fn new(network: Arc<Network<NodeMsg>>, config: &CacheConfig) -> Self {
        let max_cache_size = if config.max_bytes == 0 {
            let mut sys = System::new();
            sys.refresh_memory();
            sys.total_memory() / 3
        } else {
            config.max_bytes
        };
        info!(
            "KVStore has a max cache size of {:.3} GB",
            max_cache_size as f64 / BYTES_PER_GB
        );
        let max_values =
            NonZeroUsize::new(config.max_values).unwrap_or(NonZeroUsize::MIN);
        KVStore {
            id: network.id,
            data: RwLock::new(HashMap::new()),
            spilled: RwLock::new(HashSet::new()),
            cache: Mutex::new(Cache {
                lru: LruCache::new(max_values),
                size: 0,
            }),
            max_cache_size,
            network,
            pending: Mutex::new(HashMap::new()),
            next_req_id: AtomicUsize::new(0),
            persist: Arc::new(MemPersist::new()),
        }
    }

    /// Sets the backend that `spill` pages values out to
    pub fn with_persist(mut self, persist: Arc<dyn Persist>) -> Self {
        self.persist = persist;
        self
    }

    /// The id of the node this `KVStore` runs on
    pub fn id(&self) -> usize {
        self.id
    }

    /// The current cluster membership
    pub fn membership(&self) -> Membership {
        self.network.membership()
    }

    /// The id of the node that owns `key` under the current membership
    pub fn home_of(&self, key: &Key) -> Result<usize, LiquidError> {
        self.network
            .membership()
            .home_of(key)
            .ok_or(LiquidError::NodeLost(self.id))
    }

    /// Whether `key` is owned by this node under the current membership
    pub fn is_local(&self, key: &Key) -> Result<bool, LiquidError> {
        Ok(self.home_of(key)? == self.id)
    }

    /// Gets the `Value` of `key`. The authoritative value is returned when
    /// the key is owned locally; otherwise a cached copy, or a copy fetched
    /// from the owning node.
    ///
    /// ## Errors
    /// - `NotFound` if the owning node has no value for `key`
    /// - `NodeLost` if the owning node leaves before it replies
    /// - `Remote` if the owning node failed to load or encode the value
    pub async fn get(&self, key: &Key) -> Result<Value, LiquidError> {
        let home = self.home_of(key)?;
        if home == self.id {
            return self.get_local(key);
        }
        if let Some(value) = { self.cache.lock().get(key) } {
            return Ok(value);
        }
        debug!("Fetching {} from node {}", key, home);
        let reply = self
            .request(home, |req_id| KVMessage::Get {
                req_id,
                key: key.clone(),
            })
            .await?;
        match reply {
            KVMessage::Data {
                value: Some(bytes), ..
            } => {
                let value: Value = deserialize(&bytes)?;
                self.add_to_cache(key.clone(), value.clone());
                Ok(value)
            }
            KVMessage::Data { value: None, .. } => {
                Err(LiquidError::NotFound(key.clone()))
            }
            KVMessage::Failed { message, .. } => {
                Err(LiquidError::Remote { node: home, message })
            }
            _ => Err(LiquidError::UnexpectedMessage),
        }
    }

    /// Puts `value` under `key` on the node that owns `key`, replacing any
    /// previous value. Returns once the owning node has stored it. Copies of
    /// the old value cached by other nodes are not invalidated.
    pub async fn put(&self, key: Key, value: Value) -> Result<(), LiquidError> {
        let home = self.home_of(&key)?;
        if home == self.id {
            debug!("Put key: {} into KVStore", key);
            self.put_local(key, value)?;
            return Ok(());
        }
        let bytes = serialize(&value)?;
        let reply = self
            .request(home, |req_id| KVMessage::Put {
                req_id,
                key: key.clone(),
                value: bytes,
            })
            .await?;
        match reply {
            KVMessage::Ack { .. } => {
                self.add_to_cache(key, value);
                Ok(())
            }
            KVMessage::Failed { message, .. } => {
                Err(LiquidError::Remote { node: home, message })
            }
            _ => Err(LiquidError::UnexpectedMessage),
        }
    }

    /// Removes `key` from the node that owns it and from this node's cache.
    /// Removing a key that does not exist is not an error.
    pub async fn remove(&self, key: &Key) -> Result<(), LiquidError> {
        self.invalidate(key);
        let home = self.home_of(key)?;
        if home == self.id {
            return self.remove_local(key);
        }
        let reply = self
            .request(home, |req_id| KVMessage::Remove {
                req_id,
                key: key.clone(),
            })
            .await?;
        match reply {
            KVMessage::Ack { .. } => Ok(()),
            KVMessage::Failed { message, .. } => {
                Err(LiquidError::Remote { node: home, message })
            }
            _ => Err(LiquidError::UnexpectedMessage),
        }
    }

    /// Drops the cached copy of `key`, so that the next `get` fetches it again
    pub fn invalidate(&self, key: &Key) {
        self.cache.lock().pop(key);
    }

    /// Pages the locally owned value of `key` out to the persistence backend.
    /// A later `get` loads it back transparently.
    pub fn spill(&self, key: &Key) -> Result<(), LiquidError> {
        let mut data = self.data.write();
        let value = data
            .get(key)
            .ok_or_else(|| LiquidError::NotFound(key.clone()))?;
        self.persist.store(key, &serialize(value)?)?;
        data.remove(key);
        self.spilled.write().insert(key.clone());
        debug!("Spilled {}", key);
        Ok(())
    }

    /// Every key this node holds the authoritative value for, in memory or
    /// spilled
    pub fn local_keys(&self) -> Vec<Key> {
        let data = self.data.read();
        let spilled = self.spilled.read();
        data.keys().chain(spilled.iter()).cloned().collect()
    }

    /// The number of values in the cache
    pub fn cache_len(&self) -> usize {
        self.cache.lock().lru.len()
    }

    /// The total deep size of the values in the cache
    pub fn cache_size(&self) -> u64 {
        self.cache.lock().size
    }

    /// Handles a message from the `KVStore` on node `sender_id`. Replies are
    /// handed to the waiting caller; requests are answered from a spawned
    /// task so that message processing never blocks on a full queue.
    pub(crate) fn process_message(
        self: &Arc<Self>,
        sender_id: usize,
        msg: KVMessage,
    ) {
        match msg {
            KVMessage::Data { req_id, .. }
            | KVMessage::Ack { req_id }
            | KVMessage::Failed { req_id, .. } => {
                let waiting = { self.pending.lock().remove(&req_id) };
                match waiting {
                    Some(sender) => {
                        let _ = sender.send(msg);
                    }
                    None => debug!("Dropped a late reply to request {}", req_id),
                }
            }
            request => {
                let kv = self.clone();
                tokio::spawn(async move {
                    let reply = kv.answer(request);
                    let sent =
                        kv.network.send_msg(sender_id, NodeMsg::Kv(reply)).await;
                    if let Err(e) = sent {
                        error!("Could not reply to node {}: {}", sender_id, e);
                    }
                });
            }
        }
    }

    fn answer(&self, request: KVMessage) -> KVMessage {
        let (req_id, result) = match request {
            KVMessage::Get { req_id, key } => {
                let result = match self.get_local(&key) {
                    Ok(v) => serialize(&v)
                        .map(|bytes| KVMessage::Data {
                            req_id,
                            value: Some(bytes),
                        })
                        .map_err(LiquidError::from),
                    Err(LiquidError::NotFound(_)) => {
                        Ok(KVMessage::Data { req_id, value: None })
                    }
                    Err(e) => Err(e),
                };
                (req_id, result)
            }
            KVMessage::Put { req_id, key, value } => {
                let result = deserialize::<Value>(&value)
                    .map_err(LiquidError::from)
                    .and_then(|v| {
                        debug!("Put key: {} into KVStore", key);
                        self.put_local(key, v)
                    })
                    .map(|()| KVMessage::Ack { req_id });
                (req_id, result)
            }
            KVMessage::Remove { req_id, key } => {
                let result =
                    self.remove_local(&key).map(|()| KVMessage::Ack { req_id });
                (req_id, result)
            }
            reply => return reply,
        };
        result.unwrap_or_else(|e| {
            error!("Request {} failed: {}", req_id, e);
            KVMessage::Failed {
                req_id,
                message: e.to_string(),
            }
        })
    }

    /// Sends the request built by `make` to node `target` and waits for the
    /// reply
    async fn request(
        &self,
        target: usize,
        make: impl FnOnce(usize) -> KVMessage,
    ) -> Result<KVMessage, LiquidError> {
        let req_id = self.next_req_id.fetch_add(1, Ordering::Relaxed);
        let (sender, mut receiver) = oneshot::channel();
        self.pending.lock().insert(req_id, sender);
        let mut membership = self.network.watch_membership();
        let sent = self.network.send_msg(target, NodeMsg::Kv(make(req_id))).await;
        if let Err(e) = sent {
            self.pending.lock().remove(&req_id);
            return Err(e);
        }
        loop {
            tokio::select! {
                reply = &mut receiver => {
                    return reply.map_err(|_| LiquidError::NodeLost(target));
                }
                changed = membership.changed() => {
                    if changed.is_err() || !membership.borrow().contains(target) {
                        self.pending.lock().remove(&req_id);
                        return Err(LiquidError::NodeLost(target));
                    }
                }
            }
        }
    }

    fn get_local(&self, key: &Key) -> Result<Value, LiquidError> {
        if let Some(value) = self.data.read().get(key) {
            return Ok(value.clone());
        }
        let mut data = self.data.write();
        let mut spilled = self.spilled.write();
        // loaded by someone else in the meantime
        if let Some(value) = data.get(key) {
            return Ok(value.clone());
        }
        if !spilled.contains(key) {
            return Err(LiquidError::NotFound(key.clone()));
        }
        let bytes = self
            .persist
            .load(key)?
            .ok_or_else(|| LiquidError::NotFound(key.clone()))?;
        let value: Value = deserialize(&bytes)?;
        self.persist.delete(key)?;
        spilled.remove(key);
        data.insert(key.clone(), value.clone());
        debug!("Loaded spilled {}", key);
        Ok(value)
    }

    fn put_local(&self, key: Key, value: Value) -> Result<(), LiquidError> {
        let mut data = self.data.write();
        if self.spilled.write().remove(&key) {
            self.persist.delete(&key)?;
        }
        data.insert(key, value);
        Ok(())
    }

    fn remove_local(&self, key: &Key) -> Result<(), LiquidError> {
        let mut data = self.data.write();
        data.remove(key);
        if self.spilled.write().remove(key) {
            self.persist.delete(key)?;
        }
        Ok(())
    }

    fn add_to_cache(&self, key: Key, value: Value) {
        let v_size = value.deep_size_of() as u64;
        if v_size > self.max_cache_size {
            error!(
                "Not caching a value of size {} with a max cache size of {}",
                v_size, self.max_cache_size
            );
            return;
        }
        let mut cache = self.cache.lock();
        cache.pop(&key);
        while cache.size + v_size > self.max_cache_size {
            match cache.lru.pop_lru() {
                Some((_, (_, size))) => {
                    info!("Popped cached value of size {} bytes", size);
                    cache.size -= size;
                }
                None => break,
            }
        }
        if let Some((_, (_, evicted))) = cache.lru.push(key, (value, v_size)) {
            cache.size -= evicted;
        }
        cache.size += v_size;
        debug!("Added value of size {} bytes to cache", v_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::NewChunk;
    use crate::column::ColumnType;
    use crate::kv::KeyKind;
    use crate::network::LocalNetwork;

    /// Starts `n` stores on one hub, each answering its own messages
    fn start(n: usize, config: &CacheConfig) -> (LocalNetwork<NodeMsg>, Vec<Arc<KVStore>>) {
        let hub = LocalNetwork::new(64);
        let mut stores = Vec::new();
        for id in 1..=n {
            let (network, mut receiver) = hub.join(id).unwrap();
            let kv = Arc::new(KVStore::new(Arc::new(network), config));
            let kv_clone = kv.clone();
            tokio::spawn(async move {
                while let Some(msg) = receiver.recv().await {
                    if let NodeMsg::Kv(m) = msg.msg {
                        kv_clone.process_message(msg.sender_id, m);
                    }
                }
            });
            stores.push(kv);
        }
        (hub, stores)
    }

    fn config() -> CacheConfig {
        CacheConfig {
            max_bytes: 1 << 20,
            max_values: 16,
            spill_dir: None,
        }
    }

    fn blob(bytes: &[u8]) -> Value {
        Value::Blob(Arc::new(bytes.to_vec()))
    }

    fn remote_key(kv: &KVStore, name: &str) -> Key {
        (0..)
            .map(|i| Key::new(&format!("{}{}", name, i), KeyKind::Blob))
            .find(|k| !kv.is_local(k).unwrap())
            .unwrap()
    }

    #[tokio::test]
    async fn test_get_put_remove() {
        let (_hub, stores) = start(3, &config());
        for i in 0..20 {
            let key = Key::new(&format!("k{}", i), KeyKind::Blob);
            let writer = &stores[i % 3];
            writer.put(key.clone(), blob(&[i as u8])).await.unwrap();
            for kv in &stores {
                let v = kv.get(&key).await.unwrap().into_blob().unwrap();
                assert_eq!(*v, vec![i as u8]);
            }
            let home = stores[0].home_of(&key).unwrap();
            assert!(stores[home - 1].local_keys().contains(&key));
        }

        let key = Key::new("k0", KeyKind::Blob);
        stores[1].remove(&key).await.unwrap();
        for kv in &stores {
            assert!(matches!(
                kv.get(&key).await,
                Err(LiquidError::NotFound(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_cached_copies_go_stale() {
        let (_hub, stores) = start(2, &config());
        let key = remote_key(&stores[0], "stale");
        let home = stores[0].home_of(&key).unwrap();
        let owner = &stores[home - 1];
        owner.put(key.clone(), blob(b"v1")).await.unwrap();
        assert_eq!(*stores[0].get(&key).await.unwrap().into_blob().unwrap(), b"v1");
        assert_eq!(stores[0].cache_len(), 1);

        owner.put(key.clone(), blob(b"v2")).await.unwrap();
        assert_eq!(*stores[0].get(&key).await.unwrap().into_blob().unwrap(), b"v1");
        stores[0].invalidate(&key);
        assert_eq!(*stores[0].get(&key).await.unwrap().into_blob().unwrap(), b"v2");
    }

    #[tokio::test]
    async fn test_values_cross_nodes() {
        let (_hub, stores) = start(2, &config());
        let col = Key::generate("col", KeyKind::Column);
        let key = (0..)
            .map(|cidx| col.chunk(cidx))
            .find(|k| !stores[0].is_local(k).unwrap())
            .unwrap();
        let mut nc = NewChunk::new(ColumnType::Numeric, 1, 10);
        nc.append_f64(0.5).unwrap();
        nc.append_na();
        let chunk = Arc::new(nc.close());
        stores[0]
            .put(key.clone(), Value::Chunk(chunk.clone()))
            .await
            .unwrap();
        let fetched = stores[1].get(&key).await.unwrap().into_chunk().unwrap();
        assert_eq!(*fetched, *chunk);
        assert!(matches!(
            stores[1].get(&key).await.unwrap().into_frame(),
            Err(LiquidError::TypeMismatch)
        ));
    }

    #[tokio::test]
    async fn test_cache_budget() {
        let config = CacheConfig {
            max_bytes: 1 << 20,
            max_values: 2,
            spill_dir: None,
        };
        let (_hub, stores) = start(2, &config);
        let home = stores[1].id;
        let mut keys = Vec::new();
        for i in 0.. {
            let key = Key::new(&format!("b{}", i), KeyKind::Blob);
            if stores[0].home_of(&key).unwrap() == home {
                stores[1].put(key.clone(), blob(&[0; 100])).await.unwrap();
                keys.push(key);
            }
            if keys.len() == 3 {
                break;
            }
        }
        for key in &keys {
            stores[0].get(key).await.unwrap();
        }
        assert_eq!(stores[0].cache_len(), 2);
        assert!(stores[0].cache_size() >= 200);
    }

    #[tokio::test]
    async fn test_spill_and_reload() {
        let (_hub, stores) = start(1, &config());
        let dir = tempfile::tempdir().unwrap();
        let persist = Arc::new(crate::kv::FilePersist::new(dir.path()).unwrap());
        let network = stores[0].network.clone();
        let kv = KVStore::new(network, &config()).with_persist(persist.clone());
        let key = Key::new("spilled", KeyKind::Blob);
        kv.put(key.clone(), blob(b"data")).await.unwrap();
        kv.spill(&key).unwrap();
        assert!(persist.load(&key).unwrap().is_some());
        assert_eq!(kv.local_keys(), vec![key.clone()]);
        assert_eq!(*kv.get(&key).await.unwrap().into_blob().unwrap(), b"data");
        assert!(persist.load(&key).unwrap().is_none());
        assert!(matches!(
            kv.spill(&Key::new("missing", KeyKind::Blob)),
            Err(LiquidError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remote_failures_are_not_masked() {
        let (_hub, stores) = start(2, &config());
        let key = remote_key(&stores[0], "broken");
        let home = stores[0].home_of(&key).unwrap();
        let owner = &stores[home - 1];
        owner.put(key.clone(), blob(b"ok")).await.unwrap();
        owner.spill(&key).unwrap();
        owner.persist.store(&key, b"garbage").unwrap();
        match stores[0].get(&key).await {
            Err(LiquidError::Remote { node, .. }) => assert_eq!(node, home),
            other => panic!("expected a remote failure, got {:?}", other),
        }
        // a key that is simply absent is still reported as such
        let absent = remote_key(&stores[0], "absent");
        assert!(matches!(
            stores[0].get(&absent).await,
            Err(LiquidError::NotFound(_))
        ));

        let malformed = KVMessage::Put {
            req_id: 9,
            key: key.clone(),
            value: b"garbage".to_vec(),
        };
        assert!(matches!(
            owner.answer(malformed),
            KVMessage::Failed { req_id: 9, .. }
        ));
    }

    #[tokio::test]
    async fn test_keys_rehome_when_a_node_leaves() {
        let (hub, stores) = start(2, &config());
        let key = remote_key(&stores[0], "lost");
        stores[0].put(key.clone(), blob(b"gone")).await.unwrap();
        hub.leave(stores[1].id);
        // the only member left owns everything, but never saw the value
        assert!(stores[0].is_local(&key).unwrap());
        assert!(matches!(
            stores[0].get(&key).await,
            Err(LiquidError::NotFound(_))
        ));
    }
}
