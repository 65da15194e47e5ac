//! Interning of stat name fragments.
//!
//! Stat names are dotted strings such as `cluster.backend.upstream_rq_total`. Storing, hashing and
//! comparing these strings on every lookup is wasteful, so every fragment between two dots is
//! interned into a [`Symbol`] by a [`SymbolTable`]. A [`StatName`] is then just the ordered
//! sequence of symbols, which is cheap to hash and compare.
//!
//! Symbols are reference counted. A [`StatNameStorage`] holds one reference per symbol and
//! releases them when dropped. Once no name refers to a fragment anymore, its symbol is freed and
//! the id is handed out again for the next new fragment.

use std::borrow::Borrow;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;

/// Separator between the fragments of a stat name.
pub const SEPARATOR: char = '.';

/// An interned stat name fragment.
///
/// Symbols are only meaningful together with the [`SymbolTable`] that created them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(u32);

impl Symbol {
    /// The symbol of the empty fragment.
    ///
    /// It is shared by all tables and is never reference counted.
    pub const EMPTY: Self = Self(0);

    /// Returns the numeric id of this symbol.
    pub fn id(self) -> u32 {
        self.0
    }
}

/// An ordered sequence of [`Symbol`]s identifying a stat.
///
/// Two names are equal if their symbols are equal, which for names created by the same table is
/// equivalent to string equality. A `StatName` does not keep its symbols alive. It must not
/// outlive the [`StatNameStorage`] it was obtained from.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatName(SmallVec<[Symbol; 6]>);

impl StatName {
    /// Returns the symbols of this name.
    pub fn symbols(&self) -> &[Symbol] {
        &self.0
    }

    /// Returns the number of fragments in this name.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if this is the empty name.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for StatName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StatName")
            .field(&self.0.iter().map(|s| s.0).collect::<Vec<_>>())
            .finish()
    }
}

/// Fragment bookkeeping for a live symbol.
#[derive(Debug)]
struct SharedSymbol {
    symbol: Symbol,
    ref_count: u32,
}

/// Critical section of the [`SymbolTable`].
#[derive(Debug)]
struct Inner {
    encode: HashMap<Arc<str>, SharedSymbol>,
    decode: HashMap<Symbol, Arc<str>>,
    /// Freed symbol ids, handed out smallest first.
    pool: BinaryHeap<Reverse<u32>>,
    next_id: u32,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            encode: HashMap::new(),
            decode: HashMap::new(),
            pool: BinaryHeap::new(),
            // Id zero is reserved for `Symbol::EMPTY`.
            next_id: 1,
        }
    }
}

impl Inner {
    fn intern(&mut self, fragment: &str) -> Symbol {
        if fragment.is_empty() {
            return Symbol::EMPTY;
        }

        if let Some(shared) = self.encode.get_mut(fragment) {
            shared.ref_count += 1;
            return shared.symbol;
        }

        let symbol = self.next_symbol();
        let fragment: Arc<str> = Arc::from(fragment);
        self.decode.insert(symbol, Arc::clone(&fragment));
        self.encode.insert(
            fragment,
            SharedSymbol {
                symbol,
                ref_count: 1,
            },
        );

        symbol
    }

    fn next_symbol(&mut self) -> Symbol {
        if let Some(Reverse(id)) = self.pool.pop() {
            return Symbol(id);
        }

        let id = self.next_id;
        assert!(id < u32::MAX, "symbol table exhausted");
        self.next_id += 1;
        Symbol(id)
    }

    fn shared_mut(&mut self, symbol: Symbol) -> &mut SharedSymbol {
        let Some(fragment) = self.decode.get(&symbol) else {
            panic!("unknown symbol {}", symbol.0);
        };

        match self.encode.get_mut(fragment.as_ref()) {
            Some(shared) => shared,
            None => panic!("symbol {} missing from encode map", symbol.0),
        }
    }

    fn retain(&mut self, symbol: Symbol) {
        if symbol != Symbol::EMPTY {
            self.shared_mut(symbol).ref_count += 1;
        }
    }

    fn release(&mut self, symbol: Symbol) {
        if symbol == Symbol::EMPTY {
            return;
        }

        let shared = self.shared_mut(symbol);
        shared.ref_count -= 1;
        if shared.ref_count > 0 {
            return;
        }

        if let Some(fragment) = self.decode.remove(&symbol) {
            self.encode.remove(fragment.as_ref());
        }
        self.pool.push(Reverse(symbol.0));
    }

    fn fragment(&self, symbol: Symbol) -> &str {
        if symbol == Symbol::EMPTY {
            return "";
        }

        match self.decode.get(&symbol) {
            Some(fragment) => fragment,
            None => panic!("unknown symbol {}", symbol.0),
        }
    }
}

/// Interns stat name fragments into reference counted [`Symbol`]s.
///
/// The table is a cheap handle: clones share the same mappings. It is passed explicitly to every
/// store that needs it, there is no process-wide instance.
///
/// All operations take a single internal lock. Interning only happens when stats are created or
/// destroyed, never when they are updated.
///
/// # Panics
///
/// Resolving or releasing a symbol that the table does not know about panics. This indicates a
/// [`StatName`] outliving its [`StatNameStorage`], which is a bug in the caller.
///
/// # Example
///
/// ```
/// use tally_stats::SymbolTable;
///
/// let table = SymbolTable::new();
/// let name = table.encode("cluster.backend.upstream_rq");
///
/// assert_eq!(name.stat_name().len(), 3);
/// assert_eq!(table.to_string(name.stat_name()), "cluster.backend.upstream_rq");
/// ```
#[derive(Clone, Default)]
pub struct SymbolTable {
    inner: Arc<Mutex<Inner>>,
}

impl SymbolTable {
    /// Creates an empty symbol table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a single fragment, taking a reference on its symbol.
    ///
    /// Every call must be balanced with a call to [`release`](Self::release). Prefer
    /// [`encode`](Self::encode), which does the bookkeeping automatically.
    pub fn intern(&self, fragment: &str) -> Symbol {
        self.inner.lock().intern(fragment)
    }

    /// Gives up a reference on a symbol, freeing it once no references remain.
    pub fn release(&self, symbol: Symbol) {
        self.inner.lock().release(symbol);
    }

    /// Returns the fragment interned for the given symbol.
    pub fn fragment(&self, symbol: Symbol) -> Arc<str> {
        let inner = self.inner.lock();
        if symbol == Symbol::EMPTY {
            return Arc::from("");
        }
        match inner.decode.get(&symbol) {
            Some(fragment) => Arc::clone(fragment),
            None => panic!("unknown symbol {}", symbol.0),
        }
    }

    /// Encodes a dotted name into a [`StatNameStorage`].
    ///
    /// The empty string encodes into the empty name.
    pub fn encode(&self, name: &str) -> StatNameStorage {
        let mut symbols = SmallVec::new();

        if !name.is_empty() {
            let mut inner = self.inner.lock();
            symbols.extend(name.split(SEPARATOR).map(|fragment| inner.intern(fragment)));
        }

        StatNameStorage {
            name: StatName(symbols),
            table: self.clone(),
        }
    }

    /// Encodes each fragment into exactly one symbol.
    ///
    /// Unlike [`encode`](Self::encode), fragments are not split on the separator, so
    /// `["a.b", "c"]` and `["a", "b.c"]` encode into different names.
    pub fn encode_fragments<'a, I>(&self, fragments: I) -> StatNameStorage
    where
        I: IntoIterator<Item = &'a str>,
    {
        let symbols = {
            let mut inner = self.inner.lock();
            fragments
                .into_iter()
                .map(|fragment| inner.intern(fragment))
                .collect()
        };

        StatNameStorage {
            name: StatName(symbols),
            table: self.clone(),
        }
    }

    /// Concatenates the given names into a new [`StatNameStorage`].
    ///
    /// Empty names contribute nothing, so joining an empty prefix with a name yields that name.
    pub fn join(&self, names: &[&StatName]) -> StatNameStorage {
        let mut symbols = SmallVec::new();

        {
            let mut inner = self.inner.lock();
            for name in names {
                for &symbol in name.symbols() {
                    inner.retain(symbol);
                    symbols.push(symbol);
                }
            }
        }

        StatNameStorage {
            name: StatName(symbols),
            table: self.clone(),
        }
    }

    /// Reconstructs the dotted string of a name.
    pub fn to_string(&self, name: &StatName) -> String {
        let inner = self.inner.lock();
        let mut string = String::new();

        for (index, &symbol) in name.symbols().iter().enumerate() {
            if index > 0 {
                string.push(SEPARATOR);
            }
            string.push_str(inner.fragment(symbol));
        }

        string
    }

    /// Returns the number of live symbols.
    pub fn num_symbols(&self) -> usize {
        self.inner.lock().decode.len()
    }

    /// Releases every symbol of `name` under a single lock.
    fn release_all(&self, name: &StatName) {
        let mut inner = self.inner.lock();
        for &symbol in name.symbols() {
            inner.release(symbol);
        }
    }
}

impl fmt::Debug for SymbolTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymbolTable")
            .field("num_symbols", &self.num_symbols())
            .finish()
    }
}

/// A [`StatName`] that owns references to its symbols.
///
/// Dropping the storage releases the references. Cloning takes new ones. Storage hashes and
/// compares exactly like its [`StatName`] and can be looked up by `&StatName` in hash maps.
pub struct StatNameStorage {
    name: StatName,
    table: SymbolTable,
}

impl StatNameStorage {
    /// Returns the name held by this storage.
    pub fn stat_name(&self) -> &StatName {
        &self.name
    }

    /// Returns the table this name was created by.
    pub fn symbol_table(&self) -> &SymbolTable {
        &self.table
    }
}

impl Clone for StatNameStorage {
    fn clone(&self) -> Self {
        self.table.join(&[&self.name])
    }
}

impl Drop for StatNameStorage {
    fn drop(&mut self) {
        self.table.release_all(&self.name);
    }
}

impl PartialEq for StatNameStorage {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for StatNameStorage {}

impl Hash for StatNameStorage {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl Borrow<StatName> for StatNameStorage {
    fn borrow(&self) -> &StatName {
        &self.name
    }
}

impl fmt::Display for StatNameStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.table.to_string(&self.name))
    }
}

impl fmt::Debug for StatNameStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StatNameStorage")
            .field(&self.table.to_string(&self.name))
            .finish()
    }
}
