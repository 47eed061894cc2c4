//! Operand parsing and validation.
//!
//! The copy engine is driven by `dd`-style `key=value` operands (`if=`, `bs=`,
//! `count=`, ...) intermixed with a handful of POSIX-style long flags
//! (`--verify`, `--prefetch`, `--dry-run`, `--chkaddr`, `-v`). `clap` captures argv
//! and the long flags; the operands themselves are tokenized and validated by hand,
//! the same two-phase shape (`parse` then a separate fallible `validate`) the
//! teacher's `Config::load`/`Config::validate` uses for its TOML file.

use std::collections::HashMap;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

/// Errors raised while parsing or validating operands.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed operand (expected key=value): {0}")]
    MalformedOperand(String),

    #[error("unknown operand: {0}")]
    UnknownOperand(String),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("unknown flag {flag} in {side}flag=")]
    UnknownFlag { side: &'static str, flag: String },

    #[error("{0} must be positive")]
    NotPositive(&'static str),

    #[error("6-byte CDB form requires count <= 256 and no FUA/DPO")]
    SixByteOverflow,

    #[error("append is incompatible with seek>0 or --verify")]
    AppendContradiction,

    #[error("mmap cannot be requested on both sides")]
    MmapBothSides,

    #[error("cdbsz must be one of 6, 10, 12, 16, got {0}")]
    BadCdbSize(u8),

    #[error("verify requires cdbsz=10, got {0}")]
    VerifyRequiresCdb10(u8),

    #[error("thr must be between 1 and 1024, got {0}")]
    BadThreadCount(u32),

    #[error("mrq batch depth must be even when both sides are pass-through")]
    MrqDepthMustBeEven,

    #[error("mrq batch depth must be divisible by three when split-write is active")]
    MrqDepthMustBeDivByThree,
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Long-opt surface layered over the operand tokenizer.
#[derive(Parser, Debug)]
#[command(name = "ddsg", about = "Concurrent SCSI pass-through block copy engine")]
pub struct CliArgs {
    /// VERIFY-with-BYTCHK=1 instead of WRITE.
    #[arg(short = 'x', long)]
    pub verify: bool,

    /// Prepend PRE-FETCH(IMMED) before each VERIFY.
    #[arg(short = 'p', long)]
    pub prefetch: bool,

    /// Prepare but skip the copy loop.
    #[arg(short = 'd', long = "dry-run")]
    pub dry_run: bool,

    /// Verify the first 4 bytes of every block against its big-endian address.
    #[arg(long)]
    pub chkaddr: bool,

    /// Extend the chkaddr comparison through the whole block in 4-byte steps.
    #[arg(long, requires = "chkaddr")]
    pub chkaddr_strict: bool,

    /// Verbosity level; repeatable.
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// `key=value` operands (if=, of=, bs=, count=, ...).
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub operands: Vec<String>,
}

/// How the engine should verify a read block's self-addressing pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChkAddr {
    #[default]
    Off,
    FirstWord,
    Strict,
}

/// Synthetic input pattern, selected by the `00`/`ff`/`random` iflag combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntheticPattern {
    Zero,
    Ff,
    SelfAddress,
    Random,
}

/// Which side(s) an MRQ restriction or an abort-injector cadence applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MrqConfig {
    pub depth: u32,
    pub side: Option<Side>,
    pub pack_cdb: bool,
}

/// One side's comma-separated flag set (`iflag=`/`oflag=`).
#[derive(Debug, Clone, Copy, Default)]
pub struct FlagSet {
    pub zero: bool,
    pub ff: bool,
    pub append: bool,
    pub coe: bool,
    pub defres: bool,
    pub dio: bool,
    pub direct: bool,
    pub dpo: bool,
    pub dsync: bool,
    pub excl: bool,
    pub fua: bool,
    pub polled: bool,
    pub masync: bool,
    pub mmap: bool,
    pub mout_if: bool,
    pub mrq_immed: bool,
    pub mrq_svb: bool,
    pub nocreat: bool,
    pub nodur: bool,
    pub noxfer: bool,
    pub null: bool,
    pub qhead: bool,
    pub qtail: bool,
    pub random: bool,
    pub same_fds: bool,
    pub v3: bool,
    pub v4: bool,
    pub wq_excl: bool,
    pub no_thresh: bool,
    pub no_unshare: bool,
    pub noshare: bool,
    /// Accepted for compatibility, never acted on (spec.md §9).
    pub swait: bool,
}

impl FlagSet {
    fn parse(side: &'static str, raw: &str) -> ConfigResult<Self> {
        let mut set = FlagSet::default();
        for tok in raw.split(',').filter(|s| !s.is_empty()) {
            match tok {
                "00" => set.zero = true,
                "ff" => set.ff = true,
                "append" => set.append = true,
                "coe" => set.coe = true,
                "defres" => set.defres = true,
                "dio" => set.dio = true,
                "direct" => set.direct = true,
                "dpo" => set.dpo = true,
                "dsync" => set.dsync = true,
                "excl" => set.excl = true,
                "fua" => set.fua = true,
                "polled" => set.polled = true,
                "masync" => set.masync = true,
                "mmap" => set.mmap = true,
                "mout_if" => set.mout_if = true,
                "mrq_immed" => set.mrq_immed = true,
                "mrq_svb" => set.mrq_svb = true,
                "nocreat" => set.nocreat = true,
                "nodur" => set.nodur = true,
                "noxfer" => set.noxfer = true,
                "null" => set.null = true,
                "qhead" => set.qhead = true,
                "qtail" => set.qtail = true,
                "random" => set.random = true,
                "same_fds" => set.same_fds = true,
                "v3" => set.v3 = true,
                "v4" => set.v4 = true,
                "wq_excl" => set.wq_excl = true,
                "no_thresh" => set.no_thresh = true,
                "no_unshare" => set.no_unshare = true,
                "noshare" => set.noshare = true,
                "swait" => set.swait = true,
                other => {
                    return Err(ConfigError::UnknownFlag {
                        side,
                        flag: other.to_string(),
                    })
                }
            }
        }
        Ok(set)
    }

    /// The synthetic pattern this flag combination selects, valid on the input side only.
    pub fn synthetic_pattern(&self) -> Option<SyntheticPattern> {
        if self.zero && self.ff {
            Some(SyntheticPattern::SelfAddress)
        } else if self.ff {
            Some(SyntheticPattern::Ff)
        } else if self.zero {
            Some(SyntheticPattern::Zero)
        } else if self.random {
            Some(SyntheticPattern::Random)
        } else {
            None
        }
    }
}

/// Subset of classic `dd` conversions accepted (`spec.md` §6).
#[derive(Debug, Clone, Copy, Default)]
pub struct ConvSet {
    pub nocreat: bool,
    pub noerror: bool,
    pub notrunc: bool,
    pub null: bool,
    pub sync: bool,
}

impl ConvSet {
    fn parse(raw: &str) -> ConfigResult<Self> {
        let mut set = ConvSet::default();
        for tok in raw.split(',').filter(|s| !s.is_empty()) {
            match tok {
                "nocreat" => set.nocreat = true,
                "noerror" => set.noerror = true,
                "notrunc" => set.notrunc = true,
                "null" => set.null = true,
                "sync" => set.sync = true,
                other => {
                    return Err(ConfigError::InvalidValue {
                        key: "conv".to_string(),
                        value: other.to_string(),
                    })
                }
            }
        }
        Ok(set)
    }
}

/// Reporting mode selected by `time=MODE[,TIMEOUT]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeMode {
    Off,
    Final,
    OnSigusr1Too,
}

/// Fully validated, immutable-after-start configuration (`spec.md` §3).
#[derive(Debug, Clone)]
pub struct Config {
    pub bs: u32,
    pub bpt: u32,
    pub count: Option<u64>,
    pub skip: u64,
    pub seek: u64,
    pub cdbsz: u8,
    pub if_path: String,
    pub of_path: Option<String>,
    pub of2_path: Option<String>,
    pub thr: u32,
    pub mrq: Option<MrqConfig>,
    pub iflag: FlagSet,
    pub oflag: FlagSet,
    pub conv: ConvSet,
    pub fua_out: bool,
    pub fua_in: bool,
    pub sync_on_exit: bool,
    pub time_mode: TimeMode,
    pub cmd_timeout: Duration,
    pub verbose: u32,
    pub verify: bool,
    pub prefetch: bool,
    pub dry_run: bool,
    pub chkaddr: ChkAddr,
    pub abort_cadence: Option<u32>,
    pub watchdog_ict: Duration,
    pub watchdog_crt: Duration,
}

impl Config {
    /// Parse operands plus the long-opt surface into a validated `Config`.
    pub fn from_args(args: &CliArgs) -> ConfigResult<Self> {
        let mut kv = HashMap::new();
        for operand in &args.operands {
            let (key, value) = operand
                .split_once('=')
                .ok_or_else(|| ConfigError::MalformedOperand(operand.clone()))?;
            kv.insert(key.to_string(), value.to_string());
        }
        Self::from_operands(&kv, args)
    }

    fn from_operands(kv: &HashMap<String, String>, args: &CliArgs) -> ConfigResult<Self> {
        let get = |k: &str| kv.get(k).map(|s| s.as_str());
        let parse_u64 = |key: &'static str, v: &str| -> ConfigResult<u64> {
            v.parse::<u64>()
                .map_err(|_| ConfigError::InvalidValue { key: key.to_string(), value: v.to_string() })
        };
        let parse_u32 = |key: &'static str, v: &str| -> ConfigResult<u32> {
            v.parse::<u32>()
                .map_err(|_| ConfigError::InvalidValue { key: key.to_string(), value: v.to_string() })
        };

        let bs = match get("bs") {
            Some(v) => parse_u32("bs", v)?,
            None => return Err(ConfigError::InvalidValue { key: "bs".to_string(), value: String::new() }),
        };
        if bs == 0 {
            return Err(ConfigError::NotPositive("bs"));
        }
        for key in ["ibs", "obs"] {
            if let Some(v) = get(key) {
                let other = parse_u32(key, v)?;
                if other != bs {
                    return Err(ConfigError::InvalidValue { key: key.to_string(), value: v.to_string() });
                }
            }
        }

        let bpt = match get("bpt") {
            Some(v) => parse_u32("bpt", v)?,
            None => {
                if bs >= 2048 {
                    32
                } else {
                    128
                }
            }
        };
        if bpt == 0 {
            return Err(ConfigError::NotPositive("bpt"));
        }

        let count = match get("count") {
            Some("-1") | None => None,
            Some(v) => Some(parse_u64("count", v)?),
        };

        let skip = get("skip").map(|v| parse_u64("skip", v)).transpose()?.unwrap_or(0);
        let seek = get("seek").map(|v| parse_u64("seek", v)).transpose()?.unwrap_or(0);

        let cdbsz = match get("cdbsz") {
            Some(v) => {
                let n: u8 = v
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue { key: "cdbsz".to_string(), value: v.to_string() })?;
                if !matches!(n, 6 | 10 | 12 | 16) {
                    return Err(ConfigError::BadCdbSize(n));
                }
                n
            }
            None => 10,
        };

        let if_path = get("if").unwrap_or("-").to_string();
        let of_path = get("of").map(|s| s.to_string());
        let of2_path = get("of2").map(|s| s.to_string());

        let thr = match get("thr") {
            Some(v) => parse_u32("thr", v)?,
            None => 1,
        };
        if !(1..=1024).contains(&thr) {
            return Err(ConfigError::BadThreadCount(thr));
        }

        let iflag = get("iflag").map(|v| FlagSet::parse("i", v)).transpose()?.unwrap_or_default();
        let oflag = get("oflag").map(|v| FlagSet::parse("o", v)).transpose()?.unwrap_or_default();
        let conv = get("conv").map(ConvSet::parse).transpose()?.unwrap_or_default();

        let fua_mask = get("fua").map(|v| parse_u32("fua", v)).transpose()?.unwrap_or(0);
        let fua_out = fua_mask & 1 != 0;
        let fua_in = fua_mask & 2 != 0;

        let sync_on_exit = matches!(get("sync"), Some("1"));

        let (time_mode, cmd_timeout) = match get("time") {
            None => (TimeMode::Off, Duration::from_secs(60)),
            Some(v) => {
                let mut parts = v.splitn(2, ',');
                let mode = parts.next().unwrap_or("0");
                let mode = match mode {
                    "0" => TimeMode::Off,
                    "1" => TimeMode::Final,
                    "2" => TimeMode::OnSigusr1Too,
                    other => {
                        return Err(ConfigError::InvalidValue { key: "time".to_string(), value: other.to_string() })
                    }
                };
                let timeout = match parts.next() {
                    Some(t) => Duration::from_secs(parse_u64("time", t)?),
                    None => Duration::from_secs(60),
                };
                (mode, timeout)
            }
        };

        let verbose = get("verbose")
            .map(|v| parse_u32("verbose", v))
            .transpose()?
            .unwrap_or(args.verbose as u32);

        let mrq = get("mrq").map(|v| Self::parse_mrq(v)).transpose()?;

        let abort_cadence = get("abort")
            .map(|v| parse_u32("abort", v))
            .transpose()?;

        let watchdog_ict = Duration::from_millis(
            get("ict").map(|v| parse_u64("ict", v)).transpose()?.unwrap_or(2000),
        );
        let watchdog_crt = Duration::from_secs(
            get("crt").map(|v| parse_u64("crt", v)).transpose()?.unwrap_or(10),
        );

        let chkaddr = if args.chkaddr_strict {
            ChkAddr::Strict
        } else if args.chkaddr {
            ChkAddr::FirstWord
        } else {
            ChkAddr::Off
        };

        let cfg = Config {
            bs,
            bpt,
            count,
            skip,
            seek,
            cdbsz,
            if_path,
            of_path,
            of2_path,
            thr,
            mrq,
            iflag,
            oflag,
            conv,
            fua_out,
            fua_in,
            sync_on_exit,
            time_mode,
            cmd_timeout,
            verbose,
            verify: args.verify,
            prefetch: args.prefetch,
            dry_run: args.dry_run,
            chkaddr,
            abort_cadence,
            watchdog_ict,
            watchdog_crt,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn parse_mrq(raw: &str) -> ConfigResult<MrqConfig> {
        let mut parts = raw.split(',');
        let first = parts.next().unwrap_or("");
        let (side, depth_str) = match first {
            "I" | "i" => (Some(Side::In), parts.next().unwrap_or("")),
            "O" | "o" => (Some(Side::Out), parts.next().unwrap_or("")),
            other => (None, other),
        };
        let depth = depth_str
            .parse::<u32>()
            .map_err(|_| ConfigError::InvalidValue { key: "mrq".to_string(), value: raw.to_string() })?;
        let pack_cdb = matches!(parts.next(), Some("C") | Some("c"));
        Ok(MrqConfig { depth, side, pack_cdb })
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.cdbsz == 6 {
            let count_limit = self.count.map(|c| c > 256).unwrap_or(false);
            if count_limit
                || self.skip >= (1 << 21)
                || self.seek >= (1 << 21)
                || self.fua_in
                || self.fua_out
                || self.iflag.dpo
                || self.oflag.dpo
            {
                return Err(ConfigError::SixByteOverflow);
            }
        }
        if self.verify && self.cdbsz != 10 {
            return Err(ConfigError::VerifyRequiresCdb10(self.cdbsz));
        }
        if (self.iflag.append || self.oflag.append) && (self.seek > 0 || self.verify) {
            return Err(ConfigError::AppendContradiction);
        }
        if self.iflag.mmap && self.oflag.mmap {
            return Err(ConfigError::MmapBothSides);
        }
        if let Some(mrq) = self.mrq {
            let both_pass_through = mrq.side.is_none();
            if both_pass_through && mrq.depth % 2 != 0 {
                return Err(ConfigError::MrqDepthMustBeEven);
            }
            if self.of2_path.is_some() && mrq.depth % 3 != 0 {
                return Err(ConfigError::MrqDepthMustBeDivByThree);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(operands: &[&str]) -> CliArgs {
        CliArgs {
            verify: false,
            prefetch: false,
            dry_run: false,
            chkaddr: false,
            chkaddr_strict: false,
            verbose: 0,
            operands: operands.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn default_bpt_follows_block_size() {
        let a = args(&["bs=2048", "if=/dev/zero"]);
        let cfg = Config::from_args(&a).unwrap();
        assert_eq!(cfg.bpt, 32);

        let a = args(&["bs=512", "if=/dev/zero"]);
        let cfg = Config::from_args(&a).unwrap();
        assert_eq!(cfg.bpt, 128);
    }

    #[test]
    fn count_absent_or_negative_one_means_unbounded() {
        let a = args(&["bs=512", "if=/dev/zero"]);
        assert_eq!(Config::from_args(&a).unwrap().count, None);

        let a = args(&["bs=512", "if=/dev/zero", "count=-1"]);
        assert_eq!(Config::from_args(&a).unwrap().count, None);
    }

    #[test]
    fn six_byte_cdb_rejects_large_count() {
        let a = args(&["bs=512", "if=/dev/zero", "cdbsz=6", "count=1000"]);
        assert!(matches!(Config::from_args(&a), Err(ConfigError::SixByteOverflow)));
    }

    #[test]
    fn append_with_seek_is_a_contradiction() {
        let a = args(&["bs=512", "if=/dev/zero", "oflag=append", "seek=5"]);
        assert!(matches!(Config::from_args(&a), Err(ConfigError::AppendContradiction)));
    }

    #[test]
    fn mmap_on_both_sides_rejected() {
        let a = args(&["bs=512", "if=/dev/zero", "iflag=mmap", "oflag=mmap"]);
        assert!(matches!(Config::from_args(&a), Err(ConfigError::MmapBothSides)));
    }

    #[test]
    fn synthetic_pattern_selection() {
        let fs = FlagSet::parse("i", "00,ff").unwrap();
        assert_eq!(fs.synthetic_pattern(), Some(SyntheticPattern::SelfAddress));

        let fs = FlagSet::parse("i", "ff").unwrap();
        assert_eq!(fs.synthetic_pattern(), Some(SyntheticPattern::Ff));

        let fs = FlagSet::parse("i", "00").unwrap();
        assert_eq!(fs.synthetic_pattern(), Some(SyntheticPattern::Zero));

        let fs = FlagSet::parse("i", "random").unwrap();
        assert_eq!(fs.synthetic_pattern(), Some(SyntheticPattern::Random));
    }

    #[test]
    fn unknown_flag_is_rejected() {
        let err = FlagSet::parse("i", "bogus").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownFlag { .. }));
    }

    #[test]
    fn mrq_side_restricted_depth_may_be_odd() {
        let a = args(&["bs=512", "if=/dev/zero", "mrq=I,3"]);
        let cfg = Config::from_args(&a).unwrap();
        let mrq = cfg.mrq.unwrap();
        assert_eq!(mrq.depth, 3);
        assert_eq!(mrq.side, Some(Side::In));
    }

    #[test]
    fn mrq_both_sides_requires_even_depth() {
        let a = args(&["bs=512", "if=/dev/zero", "mrq=3"]);
        assert!(matches!(Config::from_args(&a), Err(ConfigError::MrqDepthMustBeEven)));
    }
}
