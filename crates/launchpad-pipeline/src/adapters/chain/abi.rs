//! Minimal ABI word encoding for the calls and events the pipeline uses

use crate::core::ValidationError;

const WORD_HEX: usize = 64;

pub fn encode_address(address: &str) -> Result<String, ValidationError> {
    let normalized = crate::core::types::normalize_address(address)?;
    Ok(format!("{:0>64}", &normalized[2..]))
}

pub fn encode_uint(value: u128) -> String {
    format!("{:064x}", value)
}

/// `selector ++ words`, all hex without separators
pub fn encode_call(selector: &str, words: &[String]) -> String {
    let mut data = String::with_capacity(10 + words.len() * WORD_HEX);
    data.push_str(selector);
    for word in words {
        data.push_str(word);
    }
    data
}

fn strip(word: &str) -> &str {
    word.strip_prefix("0x").unwrap_or(word)
}

/// Address held in the low 20 bytes of a 32-byte word or topic
pub fn decode_address(word: &str) -> Result<String, ValidationError> {
    let hex_word = strip(word);
    if hex_word.len() != WORD_HEX || !hex_word.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ValidationError::MalformedLog(format!("bad address word {}", word)));
    }
    if !hex_word[..24].chars().all(|c| c == '0') {
        return Err(ValidationError::MalformedLog(format!("dirty address word {}", word)));
    }
    Ok(format!("0x{}", hex_word[24..].to_ascii_lowercase()))
}

/// Unsigned integer word that must fit in a u128
pub fn decode_uint(word: &str) -> Result<u128, ValidationError> {
    let hex_word = strip(word);
    if hex_word.len() != WORD_HEX {
        return Err(ValidationError::MalformedLog(format!("bad uint word {}", word)));
    }
    if !hex_word[..32].chars().all(|c| c == '0') {
        return Err(ValidationError::MalformedLog(format!("uint overflow {}", word)));
    }
    u128::from_str_radix(&hex_word[32..], 16)
        .map_err(|e| ValidationError::MalformedLog(format!("{}: {}", word, e)))
}

/// Split `0x`-prefixed data into 32-byte words
pub fn data_words(data: &str) -> Result<Vec<String>, ValidationError> {
    let hex_data = strip(data);
    if hex_data.len() % WORD_HEX != 0 {
        return Err(ValidationError::MalformedLog(format!(
            "data length {} is not word aligned",
            hex_data.len()
        )));
    }
    Ok(hex_data
        .as_bytes()
        .chunks(WORD_HEX)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect())
}

/// Break calldata into its selector and argument words
pub fn decode_call(data: &str) -> Result<(String, Vec<String>), ValidationError> {
    if data.len() < 10 || !data.starts_with("0x") {
        return Err(ValidationError::MalformedLog(format!("calldata too short: {}", data)));
    }
    let selector = data[..10].to_ascii_lowercase();
    let words = data_words(&data[10..])?;
    Ok((selector, words))
}

/// The all-zero address used as `from` in mint transfers
pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";
