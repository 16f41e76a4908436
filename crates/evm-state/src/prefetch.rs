//! どこで: trie 先読み / 何を: (owner, root) 毎の background warmer / なぜ: commit 前に trie node を温めておくため

use alloy_primitives::{Address, B256};
use evm_triedb::{Database, Trie};
use std::collections::BTreeMap;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::debug;

/// prefetch 対象の trie key。長さで区別していた生バイト列の置き換え。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TrieKey {
    Account(Address),
    Slot(B256),
}

struct SubShared<D: Database> {
    trie: Option<D::Tr>,
    seen: usize,
    used: usize,
}

/// 1つの trie を温める worker。channel が閉じたら抜ける。
struct SubFetcher<D: Database> {
    sender: Option<Sender<Vec<TrieKey>>>,
    shared: Arc<Mutex<SubShared<D>>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl<D: Database> SubFetcher<D> {
    fn spawn(db: D, state_root: B256, owner: B256, root: B256, address: Address) -> Self {
        let (sender, receiver) = mpsc::channel::<Vec<TrieKey>>();
        let shared = Arc::new(Mutex::new(SubShared {
            trie: None,
            seen: 0,
            used: 0,
        }));
        let worker_shared = shared.clone();
        let handle = thread::spawn(move || {
            let opened = if owner == B256::ZERO {
                db.open_trie(root)
            } else {
                db.open_storage_trie(state_root, address, root, None)
            };
            let Ok(trie) = opened else {
                return;
            };
            if let Ok(mut guard) = worker_shared.lock() {
                guard.trie = Some(trie);
            }
            while let Ok(keys) = receiver.recv() {
                let Ok(mut guard) = worker_shared.lock() else {
                    return;
                };
                guard.seen += keys.len();
                let Some(trie): Option<&D::Tr> = guard.trie.as_ref() else {
                    return;
                };
                for key in keys {
                    match key {
                        TrieKey::Account(account) => {
                            let _ = trie.get_account(account);
                        }
                        TrieKey::Slot(slot) => {
                            let _ = trie.get_storage(address, slot);
                        }
                    }
                }
            }
        });
        Self {
            sender: Some(sender),
            shared,
            handle: Some(handle),
        }
    }

    /// channel を閉じて worker を回収する。以後この trie は温まらない。
    fn stop_and_join(&mut self) {
        self.sender = None;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct PrefetchInner<D: Database> {
    fetchers: BTreeMap<(B256, B256), SubFetcher<D>>,
    /// 不活性 copy が配る静的な trie。
    static_tries: BTreeMap<(B256, B256), D::Tr>,
}

/// 遷移前 root に束ねられた prefetcher。trie() で引き取った時点で
/// 該当 worker は止まり、restart はできない。
pub struct TriePrefetcher<D: Database> {
    db: D,
    root: B256,
    namespace: String,
    inner: Mutex<PrefetchInner<D>>,
    inactive: bool,
}

impl<D: Database> TriePrefetcher<D> {
    pub fn new(db: D, root: B256, namespace: &str) -> Self {
        Self {
            db,
            root,
            namespace: namespace.to_string(),
            inner: Mutex::new(PrefetchInner {
                fetchers: BTreeMap::new(),
                static_tries: BTreeMap::new(),
            }),
            inactive: false,
        }
    }

    /// key batch を該当 worker へ流す。worker は無ければ起こす。
    pub fn prefetch(&self, owner: B256, root: B256, address: Address, keys: Vec<TrieKey>) {
        if self.inactive || keys.is_empty() {
            return;
        }
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        let state_root = self.root;
        let db = self.db.clone();
        let fetcher = inner
            .fetchers
            .entry((owner, root))
            .or_insert_with(|| SubFetcher::spawn(db, state_root, owner, root, address));
        if let Some(sender) = &fetcher.sender {
            let _ = sender.send(keys);
        }
    }

    /// 温め済み trie の引き取り。対象 worker はここで止まる。
    pub fn trie(&self, owner: B256, root: B256) -> Option<D::Tr> {
        let Ok(mut inner) = self.inner.lock() else {
            return None;
        };
        if self.inactive {
            return inner.static_tries.get(&(owner, root)).cloned();
        }
        let fetcher = inner.fetchers.get_mut(&(owner, root))?;
        fetcher.stop_and_join();
        let guard = fetcher.shared.lock().ok()?;
        guard.trie.clone()
    }

    /// hit 率集計用。実際に trie へ書かれた key 数を報告する。
    pub fn used(&self, owner: B256, root: B256, count: usize) {
        let Ok(inner) = self.inner.lock() else {
            return;
        };
        if let Some(fetcher) = inner.fetchers.get(&(owner, root)) {
            if let Ok(mut guard) = fetcher.shared.lock() {
                guard.used += count;
            }
        }
    }

    pub fn close(mut self) {
        let mut seen = 0usize;
        let mut used = 0usize;
        if let Ok(inner) = self.inner.get_mut() {
            for fetcher in inner.fetchers.values_mut() {
                fetcher.stop_and_join();
                if let Ok(guard) = fetcher.shared.lock() {
                    seen += guard.seen;
                    used += guard.used;
                }
            }
        }
        debug!(
            "prefetch[{}]: closed seen={seen} used={used}",
            self.namespace
        );
    }

    /// 不活性 copy。温め済み trie は配れるが、以後 preload はしない。
    /// copy の受け手は shutdown を知らないため worker を持たせない。
    pub fn copy(&self) -> Self {
        let mut static_tries = BTreeMap::new();
        if let Ok(inner) = self.inner.lock() {
            static_tries = inner.static_tries.clone();
            for ((owner, root), fetcher) in inner.fetchers.iter() {
                if let Ok(guard) = fetcher.shared.lock() {
                    if let Some(trie) = guard.trie.clone() {
                        static_tries.insert((*owner, *root), trie);
                    }
                }
            }
        }
        Self {
            db: self.db.clone(),
            root: self.root,
            namespace: self.namespace.clone(),
            inner: Mutex::new(PrefetchInner {
                fetchers: BTreeMap::new(),
                static_tries,
            }),
            inactive: true,
        }
    }
}
