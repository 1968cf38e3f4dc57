use chrono::{DateTime, Utc};

use crate::types::{Address, Ask, RequestId, StorageRequest};

pub(crate) fn at(seconds: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(seconds, 0).expect("timestamp should be in range")
}

pub(crate) fn request_id(n: u8) -> RequestId {
    RequestId([n; 32])
}

pub(crate) fn address(n: u8) -> Address {
    Address([n; 20])
}

pub(crate) fn request(n: u8, slots: u64, duration: u64) -> StorageRequest {
    StorageRequest {
        id: request_id(n),
        client: address(0xcc),
        ask: Ask {
            slots,
            slot_size: 1 << 20,
            duration,
            proof_probability: 5,
            price_per_byte_per_second: 1_000,
            collateral_per_byte: 10,
            max_slot_loss: 1,
        },
        content_cid: "zDvZRwzmAkhzDRPH5EW242gJBNZ2T7aoH2v1fVH66FxXL4kSbvyM".to_string(),
        expiry: at(1_000_000),
    }
}
