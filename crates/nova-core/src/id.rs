const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
/// Base62 digits needed to cover a 128-bit payload.
const ENCODED_LENGTH: usize = 22;

// Resource ID prefixes
pub const FUNCTION_PREFIX: &str = "fn_";
pub const VM_PREFIX: &str = "vm_";
pub const NODE_PREFIX: &str = "node_";
pub const REQUEST_PREFIX: &str = "req_";

/// Prefix for template (zygote) sentinel function ids: `_template_<runtime>`.
pub const TEMPLATE_FUNCTION_PREFIX: &str = "_template_";

/// Mint a fresh id for the given resource kind: `{prefix}{base62(uuidv7)}`.
///
/// UUIDv7 payloads are time-ordered, so ids of one kind sort by creation.
pub fn generate_id(prefix: &str) -> String {
    encode_id(prefix, uuid::Uuid::now_v7().into_bytes())
}

/// Render the prefix and the zero-padded base62 payload into one buffer.
/// The prefix is part of the id format, not a decoration callers bolt on.
fn encode_id(prefix: &str, bytes: [u8; 16]) -> String {
    let mut out = vec![ALPHABET[0]; prefix.len() + ENCODED_LENGTH];
    out[..prefix.len()].copy_from_slice(prefix.as_bytes());

    let mut num = u128::from_be_bytes(bytes);
    let mut at = out.len();
    while num > 0 {
        at -= 1;
        out[at] = ALPHABET[(num % 62) as usize];
        num /= 62;
    }
    String::from_utf8(out).unwrap()
}

/// Split a prefixed id into its resource kind and raw 16-byte payload.
///
/// Rejects ids with a missing separator, a payload of the wrong length,
/// characters outside the alphabet, or a payload exceeding 128 bits.
pub fn parse_id(id: &str) -> Result<(String, [u8; 16]), String> {
    let split = id
        .rfind('_')
        .ok_or("invalid id: missing prefix separator")?
        + 1;
    let (prefix, encoded) = id.split_at(split);
    if encoded.len() != ENCODED_LENGTH {
        return Err(format!(
            "invalid id {}: expected {} payload characters, got {}",
            id,
            ENCODED_LENGTH,
            encoded.len()
        ));
    }

    let mut num: u128 = 0;
    for c in encoded.bytes() {
        let digit = match c {
            b'0'..=b'9' => c - b'0',
            b'A'..=b'Z' => c - b'A' + 10,
            b'a'..=b'z' => c - b'a' + 36,
            _ => return Err(format!("invalid id {}: character {:?}", id, c as char)),
        };
        num = num
            .checked_mul(62)
            .and_then(|n| n.checked_add(digit as u128))
            .ok_or_else(|| format!("invalid id {}: payload exceeds 128 bits", id))?;
    }
    Ok((prefix.to_string(), num.to_be_bytes()))
}

/// Sentinel function id used when booting a runtime template with no user code.
pub fn template_function_id(runtime: &str) -> String {
    format!("{}{}", TEMPLATE_FUNCTION_PREFIX, runtime)
}
