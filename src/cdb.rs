//! SCSI CDB (command descriptor block) construction.
//!
//! Opcode table and field layout follow `src/iscsi/scsi.rs` (there used to
//! *parse* an incoming CDB; here the same byte layout is used to *build* an
//! outgoing one).

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CdbError {
    #[error("6-byte CDB form cannot address more than 256 blocks, got {0}")]
    SixByteCountOverflow(u32),

    #[error("6-byte CDB form cannot address LBA >= 2^21, got {0}")]
    SixByteLbaOverflow(u64),

    #[error("6-byte CDB form does not support FUA/DPO")]
    SixByteNoFuaDpo,

    #[error("10-byte CDB form cannot address more than 65535 blocks, got {0}")]
    TenByteCountOverflow(u32),

    #[error("VERIFY is only defined for the 10-byte CDB form, got cdbsz={0}")]
    VerifyRequiresTenByte(u8),

    #[error("unsupported CDB size {0}, must be one of 6, 10, 12, 16")]
    BadCdbSize(u8),
}

pub mod opcodes {
    pub const READ_6: u8 = 0x08;
    pub const READ_10: u8 = 0x28;
    pub const READ_12: u8 = 0xA8;
    pub const READ_16: u8 = 0x88;

    pub const WRITE_6: u8 = 0x0A;
    pub const WRITE_10: u8 = 0x2A;
    pub const WRITE_12: u8 = 0xAA;
    pub const WRITE_16: u8 = 0x8A;

    pub const VERIFY_10: u8 = 0x2F;

    pub const PRE_FETCH_10: u8 = 0x34;
    pub const PRE_FETCH_16: u8 = 0x90;

    pub const SYNCHRONIZE_CACHE_10: u8 = 0x35;
    pub const SYNCHRONIZE_CACHE_16: u8 = 0x91;
}

/// Which command family to build. `Verify` implies BYTCHK=1 and is only valid for
/// the 10-byte form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CdbKind {
    Read,
    Write,
    Verify,
    PreFetch,
    SyncCache,
}

/// Parameters for one CDB, independent of the wire form chosen.
#[derive(Debug, Clone, Copy)]
pub struct CdbParams {
    pub kind: CdbKind,
    pub cdb_size: u8,
    pub lba: u64,
    pub blocks: u32,
    pub fua: bool,
    pub dpo: bool,
    /// PRE-FETCH(IMMED): don't wait for the prefetch to complete.
    pub immed: bool,
}

/// Build a CDB, returning exactly `cdb_size` bytes.
pub fn build_cdb(p: &CdbParams) -> Result<Vec<u8>, CdbError> {
    if p.kind == CdbKind::Verify && p.cdb_size != 10 {
        return Err(CdbError::VerifyRequiresTenByte(p.cdb_size));
    }
    match p.cdb_size {
        6 => build_cdb6(p),
        10 => build_cdb10(p),
        12 => build_cdb12(p),
        16 => build_cdb16(p),
        other => Err(CdbError::BadCdbSize(other)),
    }
}

fn control_byte(fua: bool, dpo: bool) -> u8 {
    (if dpo { 0x10 } else { 0 }) | (if fua { 0x08 } else { 0 })
}

fn build_cdb6(p: &CdbParams) -> Result<Vec<u8>, CdbError> {
    if p.blocks > 256 {
        return Err(CdbError::SixByteCountOverflow(p.blocks));
    }
    if p.lba >= (1 << 21) {
        return Err(CdbError::SixByteLbaOverflow(p.lba));
    }
    if p.fua || p.dpo {
        return Err(CdbError::SixByteNoFuaDpo);
    }
    let opcode = match p.kind {
        CdbKind::Read => opcodes::READ_6,
        CdbKind::Write => opcodes::WRITE_6,
        CdbKind::Verify => return Err(CdbError::VerifyRequiresTenByte(6)),
        CdbKind::PreFetch | CdbKind::SyncCache => return Err(CdbError::BadCdbSize(6)),
    };
    let lba = p.lba as u32;
    // 256 blocks is encoded as 0 in the 1-byte length field.
    let length_byte = if p.blocks == 256 { 0 } else { p.blocks as u8 };
    Ok(vec![
        opcode,
        ((lba >> 16) & 0x1f) as u8,
        ((lba >> 8) & 0xff) as u8,
        (lba & 0xff) as u8,
        length_byte,
        0,
    ])
}

fn build_cdb10(p: &CdbParams) -> Result<Vec<u8>, CdbError> {
    if p.blocks > 65_535 {
        return Err(CdbError::TenByteCountOverflow(p.blocks));
    }
    let lba = p.lba as u32;
    let mut cdb = vec![0u8; 10];
    if p.kind == CdbKind::PreFetch {
        cdb[0] = opcodes::PRE_FETCH_10;
        cdb[1] = if p.immed { 0x02 } else { 0 };
        cdb[2..6].copy_from_slice(&lba.to_be_bytes());
        cdb[7..9].copy_from_slice(&(p.blocks as u16).to_be_bytes());
        return Ok(cdb);
    }
    if p.kind == CdbKind::SyncCache {
        cdb[0] = opcodes::SYNCHRONIZE_CACHE_10;
        cdb[2..6].copy_from_slice(&lba.to_be_bytes());
        cdb[7..9].copy_from_slice(&(p.blocks as u16).to_be_bytes());
        return Ok(cdb);
    }
    let (opcode, bytchk) = match p.kind {
        CdbKind::Read => (opcodes::READ_10, 0),
        CdbKind::Write => (opcodes::WRITE_10, 0),
        CdbKind::Verify => (opcodes::VERIFY_10, 0x02), // BYTCHK=1 in bit 1
        CdbKind::PreFetch | CdbKind::SyncCache => unreachable!(),
    };
    cdb[0] = opcode;
    cdb[1] = control_byte(p.fua, p.dpo) | bytchk;
    cdb[2..6].copy_from_slice(&lba.to_be_bytes());
    cdb[7..9].copy_from_slice(&(p.blocks as u16).to_be_bytes());
    Ok(cdb)
}

fn build_cdb12(p: &CdbParams) -> Result<Vec<u8>, CdbError> {
    let opcode = match p.kind {
        CdbKind::Read => opcodes::READ_12,
        CdbKind::Write => opcodes::WRITE_12,
        CdbKind::Verify => return Err(CdbError::VerifyRequiresTenByte(12)),
        CdbKind::PreFetch | CdbKind::SyncCache => return Err(CdbError::BadCdbSize(12)),
    };
    let lba = p.lba as u32;
    let mut cdb = vec![0u8; 12];
    cdb[0] = opcode;
    cdb[1] = control_byte(p.fua, p.dpo);
    cdb[2..6].copy_from_slice(&lba.to_be_bytes());
    cdb[6..10].copy_from_slice(&p.blocks.to_be_bytes());
    Ok(cdb)
}

fn build_cdb16(p: &CdbParams) -> Result<Vec<u8>, CdbError> {
    let mut cdb = vec![0u8; 16];
    if p.kind == CdbKind::PreFetch {
        cdb[0] = opcodes::PRE_FETCH_16;
        cdb[1] = if p.immed { 0x02 } else { 0 };
        cdb[2..10].copy_from_slice(&p.lba.to_be_bytes());
        cdb[10..14].copy_from_slice(&p.blocks.to_be_bytes());
        return Ok(cdb);
    }
    if p.kind == CdbKind::SyncCache {
        cdb[0] = opcodes::SYNCHRONIZE_CACHE_16;
        cdb[2..10].copy_from_slice(&p.lba.to_be_bytes());
        cdb[10..14].copy_from_slice(&p.blocks.to_be_bytes());
        return Ok(cdb);
    }
    let opcode = match p.kind {
        CdbKind::Read => opcodes::READ_16,
        CdbKind::Write => opcodes::WRITE_16,
        CdbKind::Verify => return Err(CdbError::VerifyRequiresTenByte(16)),
        CdbKind::PreFetch | CdbKind::SyncCache => unreachable!(),
    };
    cdb[0] = opcode;
    cdb[1] = control_byte(p.fua, p.dpo);
    cdb[2..10].copy_from_slice(&p.lba.to_be_bytes());
    cdb[10..14].copy_from_slice(&p.blocks.to_be_bytes());
    Ok(cdb)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(kind: CdbKind, cdb_size: u8) -> CdbParams {
        CdbParams { kind, cdb_size, lba: 0, blocks: 1, fua: false, dpo: false, immed: false }
    }

    #[test]
    fn read10_opcode_and_fields() {
        let mut p = base(CdbKind::Read, 10);
        p.lba = 0x1234;
        p.blocks = 8;
        let cdb = build_cdb(&p).unwrap();
        assert_eq!(cdb.len(), 10);
        assert_eq!(cdb[0], opcodes::READ_10);
        assert_eq!(u32::from_be_bytes(cdb[2..6].try_into().unwrap()), 0x1234);
        assert_eq!(u16::from_be_bytes(cdb[7..9].try_into().unwrap()), 8);
    }

    #[test]
    fn verify10_sets_bytchk() {
        let p = base(CdbKind::Verify, 10);
        let cdb = build_cdb(&p).unwrap();
        assert_eq!(cdb[0], opcodes::VERIFY_10);
        assert_eq!(cdb[1] & 0x02, 0x02);
    }

    #[test]
    fn verify_requires_10_byte() {
        let p = base(CdbKind::Verify, 16);
        assert_eq!(build_cdb(&p), Err(CdbError::VerifyRequiresTenByte(16)));
    }

    #[test]
    fn six_byte_rejects_large_count() {
        let mut p = base(CdbKind::Read, 6);
        p.blocks = 257;
        assert_eq!(build_cdb(&p), Err(CdbError::SixByteCountOverflow(257)));
    }

    #[test]
    fn six_byte_256_blocks_encodes_as_zero() {
        let mut p = base(CdbKind::Read, 6);
        p.blocks = 256;
        let cdb = build_cdb(&p).unwrap();
        assert_eq!(cdb[4], 0);
    }

    #[test]
    fn six_byte_rejects_large_lba() {
        let mut p = base(CdbKind::Write, 6);
        p.lba = 1 << 21;
        assert_eq!(build_cdb(&p), Err(CdbError::SixByteLbaOverflow(1 << 21)));
    }

    #[test]
    fn six_byte_rejects_fua_dpo() {
        let mut p = base(CdbKind::Read, 6);
        p.fua = true;
        assert_eq!(build_cdb(&p), Err(CdbError::SixByteNoFuaDpo));
    }

    #[test]
    fn ten_byte_rejects_large_count() {
        let mut p = base(CdbKind::Read, 10);
        p.blocks = 65_536;
        assert_eq!(build_cdb(&p), Err(CdbError::TenByteCountOverflow(65_536)));
    }

    #[test]
    fn prefetch16_sets_immed_bit() {
        let mut p = base(CdbKind::PreFetch, 16);
        p.immed = true;
        p.lba = 42;
        let cdb = build_cdb(&p).unwrap();
        assert_eq!(cdb[0], opcodes::PRE_FETCH_16);
        assert_eq!(cdb[1], 0x02);
        assert_eq!(u64::from_be_bytes(cdb[2..10].try_into().unwrap()), 42);
    }

    #[test]
    fn bad_cdb_size_rejected() {
        let p = base(CdbKind::Read, 7);
        assert_eq!(build_cdb(&p), Err(CdbError::BadCdbSize(7)));
    }
}
