//! Plaintext encoding and message ids

use chrono::Utc;
use rand::Rng;
use sha2::{Digest, Sha256};

use tessera_core::{Error, Jid, Message};

use crate::error::Result;

/// Prefix of every generated message id
pub const MESSAGE_ID_PREFIX: &str = "3EB0";

const MAX_PADDING: u8 = 16;

/// Width of the user field hashed into message ids
const ID_USER_FIELD: usize = 20;

/// Serialize a message for encryption, followed by random padding
pub fn encode_message(message: &Message) -> Result<Vec<u8>> {
    let mut bytes = bincode::serialize(message).map_err(Error::from)?;
    write_random_padding(&mut bytes);
    Ok(bytes)
}

/// Reverse of [`encode_message`]
pub fn decode_message(bytes: &[u8]) -> Result<Message> {
    let unpadded = strip_padding(bytes)?;
    Ok(bincode::deserialize(unpadded).map_err(Error::from)?)
}

/// Serialize a message for a channel. Channel payloads are not encrypted and
/// carry no padding.
pub fn encode_plaintext(message: &Message) -> Result<Vec<u8>> {
    Ok(bincode::serialize(message).map_err(Error::from)?)
}

/// Append 1 to 16 bytes, each holding the pad length
fn write_random_padding(bytes: &mut Vec<u8>) {
    let pad = rand::thread_rng().gen_range(1..=MAX_PADDING);
    bytes.extend(std::iter::repeat(pad).take(usize::from(pad)));
}

fn strip_padding(bytes: &[u8]) -> Result<&[u8]> {
    let pad = match bytes.last() {
        Some(&pad) if (1..=MAX_PADDING).contains(&pad) && usize::from(pad) <= bytes.len() => pad,
        _ => {
            return Err(Error::Serialization("invalid plaintext padding".into()).into())
        }
    };
    Ok(&bytes[..bytes.len() - usize::from(pad)])
}

/// Current unix time in seconds
pub fn unix_timestamp_secs() -> u64 {
    u64::try_from(Utc::now().timestamp()).unwrap_or_default()
}

/// New message id: the prefix followed by 18 uppercase hex characters of a
/// SHA-256 over the time, the sender's user and 16 random bytes.
pub fn generate_message_id(me: Option<&Jid>) -> String {
    let mut data = Vec::with_capacity(8 + ID_USER_FIELD + 16);
    data.extend_from_slice(&unix_timestamp_secs().to_be_bytes());

    let mut user_field = [0u8; ID_USER_FIELD];
    if let Some(me) = me {
        let user = format!("{}@c.us", me.user);
        let len = user.len().min(ID_USER_FIELD);
        user_field[..len].copy_from_slice(&user.as_bytes()[..len]);
    }
    data.extend_from_slice(&user_field);
    data.extend_from_slice(&rand::random::<[u8; 16]>());

    let hash = hex::encode_upper(Sha256::digest(&data));
    format!("{}{}", MESSAGE_ID_PREFIX, &hash[..18])
}
