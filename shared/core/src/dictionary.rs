use std::collections::HashMap;

/// Number of leading ids reserved for `<s>`, `<pad>`, `</s>` and `<unk>`.
/// These ids are never drawn as substitute tokens by the noise operators.
pub const RESERVED_SYMBOLS: usize = 4;

pub const BOS_SYMBOL: &str = "<s>";
pub const PAD_SYMBOL: &str = "<pad>";
pub const EOS_SYMBOL: &str = "</s>";
pub const UNK_SYMBOL: &str = "<unk>";

/// The slice of a vocabulary the noise injector and the criterion need.
pub trait Dictionary {
    fn pad(&self) -> i64;

    fn eos(&self) -> i64;

    /// Total number of symbols, reserved ones included.
    fn len(&self) -> usize;

    fn symbol(&self, id: i64) -> Option<&str>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of ids eligible as substitutes, i.e. everything past the reserved prefix.
    fn substitute_pool(&self) -> usize {
        self.len().saturating_sub(RESERVED_SYMBOLS)
    }
}

/// A plain symbol table with the reserved prefix
/// `<s>`=0, `<pad>`=1, `</s>`=2, `<unk>`=3.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    symbols: Vec<String>,
    indices: HashMap<String, i64>,
}

impl Default for Vocabulary {
    fn default() -> Self {
        let mut vocab = Self {
            symbols: Vec::new(),
            indices: HashMap::new(),
        };
        for symbol in [BOS_SYMBOL, PAD_SYMBOL, EOS_SYMBOL, UNK_SYMBOL] {
            vocab.add_symbol(symbol);
        }
        vocab
    }
}

impl Vocabulary {
    pub fn new() -> Self {
        Self::default()
    }

    /// A vocabulary of `size` symbols total, with generated names past the reserved prefix.
    pub fn synthetic(size: usize) -> Self {
        let mut vocab = Self::default();
        for i in RESERVED_SYMBOLS..size {
            vocab.add_symbol(&format!("tok{i}"));
        }
        vocab
    }

    pub fn add_symbol(&mut self, symbol: &str) -> i64 {
        if let Some(id) = self.indices.get(symbol) {
            return *id;
        }
        let id = self.symbols.len() as i64;
        self.symbols.push(symbol.to_string());
        self.indices.insert(symbol.to_string(), id);
        id
    }

    pub fn index(&self, symbol: &str) -> i64 {
        self.indices.get(symbol).copied().unwrap_or(self.unk())
    }

    pub fn bos(&self) -> i64 {
        0
    }

    pub fn unk(&self) -> i64 {
        3
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    /// Renders ids as a space separated string, dropping padding.
    pub fn string(&self, ids: &[i64]) -> String {
        ids.iter()
            .filter(|&&id| id != self.pad())
            .map(|&id| self.symbol(id).unwrap_or(UNK_SYMBOL))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Dictionary for Vocabulary {
    fn pad(&self) -> i64 {
        1
    }

    fn eos(&self) -> i64 {
        2
    }

    fn len(&self) -> usize {
        self.symbols.len()
    }

    fn symbol(&self, id: i64) -> Option<&str> {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.symbols.get(i))
            .map(String::as_str)
    }
}
