use std::collections::HashMap;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("SERVER_MASTER_KEY is required (64 hex chars)")]
    MissingMasterKey,

    #[error("SERVER_MASTER_KEY is invalid: {0}")]
    BadMasterKey(String),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub master_key: [u8; 32],
    pub vault_dir: PathBuf,
    pub db_path: Option<PathBuf>,
    pub bot_base_url: String,
    pub bot_api_key: String,
    pub bot_default_name: String,
    pub auth_userinfo_url: Option<String>,
    pub auth_static_tokens: HashMap<String, String>,
    pub transcriber_cmd: Option<String>,
    pub summarizer_url: Option<String>,
    pub summarizer_model: String,
}

impl ServerConfig {
    /// Load configuration from the environment. The master key is the one
    /// fatal requirement; everything else has a default or degrades to the
    /// development mocks.
    pub fn from_env() -> Result<Self, ConfigError> {
        let master_key = match std::env::var("SERVER_MASTER_KEY") {
            Ok(value) => parse_master_key(&value)?,
            Err(_) => return Err(ConfigError::MissingMasterKey),
        };

        let mut config = Self {
            port: 3002,
            master_key,
            vault_dir: PathBuf::from("./storage_vault"),
            db_path: None,
            bot_base_url: String::new(),
            bot_api_key: String::new(),
            bot_default_name: "Greffier Notetaker".to_string(),
            auth_userinfo_url: None,
            auth_static_tokens: HashMap::new(),
            transcriber_cmd: None,
            summarizer_url: None,
            summarizer_model: "llama3.1".to_string(),
        };

        if let Ok(val) = std::env::var("PORT") {
            match val.parse::<u16>() {
                Ok(port) => config.port = port,
                Err(_) => tracing::warn!(value = %val, "Invalid PORT, using default"),
            }
        }

        if let Ok(path) = std::env::var("VAULT_DIR") {
            config.vault_dir = PathBuf::from(path);
        }

        if let Ok(path) = std::env::var("DB_PATH") {
            config.db_path = Some(PathBuf::from(path));
        }

        if let Ok(url) = std::env::var("BOT_API_URL") {
            config.bot_base_url = url;
        }
        if let Ok(key) = std::env::var("BOT_API_KEY") {
            config.bot_api_key = key;
        }
        if let Ok(name) = std::env::var("BOT_DEFAULT_NAME") {
            if !name.is_empty() {
                config.bot_default_name = name;
            }
        }

        if let Ok(url) = std::env::var("AUTH_USERINFO_URL") {
            if !url.is_empty() {
                config.auth_userinfo_url = Some(url);
            }
        }
        if let Ok(tokens) = std::env::var("AUTH_STATIC_TOKENS") {
            config.auth_static_tokens = parse_static_tokens(&tokens);
        }

        if let Ok(cmd) = std::env::var("TRANSCRIBER_CMD") {
            if !cmd.is_empty() {
                config.transcriber_cmd = Some(cmd);
            }
        }
        if let Ok(url) = std::env::var("SUMMARIZER_URL") {
            if !url.is_empty() {
                config.summarizer_url = Some(url);
            }
        }
        if let Ok(model) = std::env::var("SUMMARIZER_MODEL") {
            if !model.is_empty() {
                config.summarizer_model = model;
            }
        }

        Ok(config)
    }
}

fn parse_master_key(hex_str: &str) -> Result<[u8; 32], ConfigError> {
    let hex_str = hex_str.trim();
    if hex_str.len() != 64 {
        return Err(ConfigError::BadMasterKey(format!(
            "expected 64 hex chars, got {}",
            hex_str.len()
        )));
    }
    let bytes = hex::decode(hex_str).map_err(|e| ConfigError::BadMasterKey(e.to_string()))?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// `token1:user1,token2:user2` -- the development verifier.
fn parse_static_tokens(raw: &str) -> HashMap<String, String> {
    let mut tokens = HashMap::new();
    for pair in raw.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        match pair.split_once(':') {
            Some((token, user)) if !token.is_empty() && !user.is_empty() => {
                tokens.insert(token.to_string(), user.to_string());
            }
            _ => tracing::warn!(entry = %pair, "Ignoring malformed AUTH_STATIC_TOKENS entry"),
        }
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_key_roundtrip() {
        let hex = "ab".repeat(32);
        let key = parse_master_key(&hex).unwrap();
        assert_eq!(key, [0xab; 32]);
    }

    #[test]
    fn master_key_wrong_length() {
        assert!(parse_master_key("abcd").is_err());
    }

    #[test]
    fn master_key_bad_hex() {
        assert!(parse_master_key(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn static_tokens_parse() {
        let tokens = parse_static_tokens("tok-a:alice, tok-b:bob,,broken");
        assert_eq!(tokens.get("tok-a").map(String::as_str), Some("alice"));
        assert_eq!(tokens.get("tok-b").map(String::as_str), Some("bob"));
        assert_eq!(tokens.len(), 2);
    }
}
