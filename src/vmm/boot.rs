use log::info;
use std::path::Path;
use vm_memory::GuestAddress;

use crate::error::Result;
use super::memory::GuestMem;


/// Real-mode payload: prints `'0' + al + bl` and a newline on COM1, then halts.
pub const DEFAULT_PAYLOAD: &[u8] = &[
    0xba, 0xf8, 0x03, // mov $0x3f8, %dx
    0x00, 0xd8, // add %bl, %al
    0x04, b'0', // add $'0', %al
    0xee, // out %al, (%dx)
    0xb0, b'\n', // mov $'\n', %al
    0xee, // out %al, (%dx)
    0xf4, // hlt
];


pub struct BootInfo { pub entry: GuestAddress, pub payload_len: usize }


pub fn read_payload(path: Option<&Path>) -> Result<Vec<u8>> {
    match path {
        Some(p) => Ok(std::fs::read(p)?),
        None => Ok(DEFAULT_PAYLOAD.to_vec()),
    }
}


/// Copy the payload to the start of `gm`; execution begins at its first byte.
pub fn load_payload(gm: &GuestMem, payload: &[u8]) -> Result<BootInfo> {
    gm.load_payload(payload)?;
    info!("loaded {} payload bytes at guest {:#x}", payload.len(), gm.base().0);
    Ok(BootInfo { entry: gm.base(), payload_len: payload.len() })
}
