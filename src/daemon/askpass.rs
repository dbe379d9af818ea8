use std::{collections::HashMap, sync::Mutex};

use rand::{distributions::Alphanumeric, Rng};

use crate::consts;

/// Mint a fresh random token for an askpass or companion-init
/// callback. Tokens only ever live in daemon memory and in the
/// environment of the child they were minted for.
pub fn mint_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(consts::TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// The alias -> askpass token table. Guarded by its own mutex so the
/// ASKPASS verb never has to touch the daemon lock.
pub struct TokenTable {
    tokens: Mutex<HashMap<String, String>>,
}

impl TokenTable {
    pub fn new() -> Self {
        TokenTable { tokens: Mutex::new(HashMap::new()) }
    }

    /// Mint and register a token for an alias, displacing any previous
    /// one (each connection attempt gets its own secret).
    pub fn mint(&self, alias: &str) -> String {
        let token = mint_token();
        let mut tokens = self.tokens.lock().unwrap();
        tokens.insert(String::from(alias), token.clone());
        token
    }

    pub fn verify(&self, alias: &str, token: &str) -> bool {
        let tokens = self.tokens.lock().unwrap();
        tokens.get(alias).map(|t| t == token).unwrap_or(false)
    }

    pub fn remove(&self, alias: &str) {
        let mut tokens = self.tokens.lock().unwrap();
        tokens.remove(alias);
    }
}

impl Default for TokenTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mint_verify_remove() {
        let table = TokenTable::new();
        let token = table.mint("webdev");
        assert_eq!(token.len(), consts::TOKEN_LEN);
        assert!(table.verify("webdev", &token));
        assert!(!table.verify("webdev", "bogus"));
        assert!(!table.verify("other", &token));

        table.remove("webdev");
        assert!(!table.verify("webdev", &token));
    }

    #[test]
    fn reminting_displaces_the_old_token() {
        let table = TokenTable::new();
        let first = table.mint("webdev");
        let second = table.mint("webdev");
        assert_ne!(first, second);
        assert!(!table.verify("webdev", &first));
        assert!(table.verify("webdev", &second));
    }
}
