//! procfs decoding: `/proc/<pid>/maps` and `/proc/<pid>/auxv`.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Error, ErrorKind, Read, Result};
use std::path::PathBuf;

use combine::error::ParseError;
use combine::parser::char::{char, digit, hex_digit, spaces};
use combine::{choice, many1, none_of, optional, Parser, Stream};

use log::warn;
use nix::unistd::Pid;

/// one line of `/proc/<pid>/maps`, ordered by `start`.
#[derive(Clone, PartialEq, Eq)]
pub struct ProcMapsEntry {
    pub start: u64,
    pub end: u64,
    /// the kernel's 4-character `rwxp` permission string.
    pub perms: String,
    pub offset: u64,
    pub dev: i32,
    pub inode: u64,
    pub pathname: Option<String>,
}

impl ProcMapsEntry {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
    pub fn is_read(&self) -> bool {
        self.perms.as_bytes()[0] == b'r'
    }
    pub fn is_exec(&self) -> bool {
        self.perms.as_bytes()[2] == b'x'
    }
    pub fn is_file_backed(&self) -> bool {
        self.inode != 0
    }
}

impl std::fmt::Debug for ProcMapsEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = format!(
            "{:x}-{:x} {} {:08x} {:02x}:{:02x} {}",
            self.start,
            self.end,
            self.perms,
            self.offset,
            self.dev.wrapping_shr(8),
            self.dev & 0xff,
            self.inode
        );
        let pad = 73usize.saturating_sub(s.len());
        write!(
            f,
            "{}{}{}",
            s,
            " ".repeat(pad),
            self.pathname.as_ref().map(String::as_str).unwrap_or("")
        )
    }
}

fn hex_value<I>() -> impl Parser<Input = I, Output = u64>
where
    I: Stream<Item = char>,
    // Necessary due to rust-lang/rust#24159
    I::Error: ParseError<I::Item, I::Range, I::Position>,
{
    many1::<String, _>(hex_digit())
        .map(|s| u64::from_str_radix(&s, 16).unwrap())
}

fn dec_value<I>() -> impl Parser<Input = I, Output = u64>
where
    I: Stream<Item = char>,
    I::Error: ParseError<I::Item, I::Range, I::Position>,
{
    many1::<String, _>(digit()).map(|s| s.parse::<u64>().unwrap())
}

fn dev<I>() -> impl Parser<Input = I, Output = i32>
where
    I: Stream<Item = char>,
    I::Error: ParseError<I::Item, I::Range, I::Position>,
{
    // the kernel prints %02x:%02x but large device numbers widen the field
    (
        spaces(),
        many1::<String, _>(hex_digit()),
        char(':'),
        many1::<String, _>(hex_digit()),
    )
        .map(|(_, major, _, minor)| {
            i32::from_str_radix(&major, 16).unwrap() * 256
                + i32::from_str_radix(&minor, 16).unwrap()
        })
}

fn perms<I>() -> impl Parser<Input = I, Output = String>
where
    I: Stream<Item = char>,
    I::Error: ParseError<I::Item, I::Range, I::Position>,
{
    (
        spaces(),
        choice([char('-'), char('r')]),
        choice([char('-'), char('w')]),
        choice([char('-'), char('x')]),
        choice([char('-'), char('s'), char('p')]),
    )
        .map(|(_, r, w, x, p)| {
            let mut s = String::with_capacity(4);
            s.push(r);
            s.push(w);
            s.push(x);
            s.push(p);
            s
        })
}

fn filepath<I>() -> impl Parser<Input = I, Output = Option<String>>
where
    I: Stream<Item = char>,
    I::Error: ParseError<I::Item, I::Range, I::Position>,
{
    // pathnames may contain spaces and bracketed pseudo-names such as
    // `[anon:scudo:primary]`, so take everything up to end of line.
    (spaces(), optional(many1::<String, _>(none_of("\r\n".chars()))))
        .map(|(_, path)| path)
}

fn parser<I>() -> impl Parser<Input = I, Output = ProcMapsEntry>
where
    I: Stream<Item = char>,
    I::Error: ParseError<I::Item, I::Range, I::Position>,
{
    (
        hex_value(),
        char('-'),
        hex_value(),
        perms(),
        spaces(),
        hex_value(),
        dev(),
        spaces(),
        dec_value(),
        filepath(),
    )
        .map(
            |(start, _, end, perms, _, offset, devno, _, inode, pathname)| {
                ProcMapsEntry {
                    start,
                    end,
                    perms,
                    offset,
                    dev: devno,
                    inode,
                    pathname,
                }
            },
        )
}

fn parse_proc_maps_entry(line: &str) -> Result<ProcMapsEntry> {
    match parser().easy_parse(line) {
        Ok((result, _)) => Ok(result),
        Err(parse_error) => Err(Error::new(
            ErrorKind::Other,
            format!("parse error: {}", parse_error),
        )),
    }
}

/// decode `/proc/<pid>/maps`. malformed lines are logged and skipped
/// rather than failing the whole snapshot.
pub fn decode_proc_maps(pid: Pid) -> Result<Vec<ProcMapsEntry>> {
    let filepath = PathBuf::from("/proc")
        .join(&format!("{}", pid))
        .join("maps");
    let mut file = File::open(filepath)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    let mut ents: Vec<ProcMapsEntry> = Vec::new();
    for line in contents.lines() {
        match parse_proc_maps_entry(line) {
            Ok(ent) => ents.push(ent),
            Err(e) => warn!("[maps] pid {} skipping line {:?}: {}", pid, line, e),
        }
    }
    Ok(ents)
}

/// the kernel-populated auxiliary vector of a (64-bit) process.
#[derive(Debug, Clone)]
pub struct AuxVec {
    entries: HashMap<u64, u64>,
}

impl AuxVec {
    pub fn get(&self, tag: u64) -> Option<u64> {
        self.entries.get(&tag).cloned()
    }

    /// like [`get`](AuxVec::get) but a missing tag is an error naming it.
    pub fn require(&self, tag: u64) -> Result<u64> {
        self.get(tag).ok_or_else(|| {
            Error::new(
                ErrorKind::NotFound,
                format!("auxv entry {} ({}) missing", auxv_tag_name(tag), tag),
            )
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.entries.iter().map(|(&tag, &val)| (tag, val))
    }
}

pub fn auxv_tag_name(tag: u64) -> &'static str {
    match tag {
        x if x == libc::AT_PHDR => "AT_PHDR",
        x if x == libc::AT_PHENT => "AT_PHENT",
        x if x == libc::AT_PHNUM => "AT_PHNUM",
        x if x == libc::AT_PAGESZ => "AT_PAGESZ",
        x if x == libc::AT_BASE => "AT_BASE",
        x if x == libc::AT_ENTRY => "AT_ENTRY",
        x if x == libc::AT_EXECFN => "AT_EXECFN",
        _ => "AT_???",
    }
}

/// read `/proc/<pid>/auxv`: a stream of 16-byte `(tag, value)` pairs
/// terminated by `AT_NULL`. unknown tags are kept, duplicates keep the
/// first value (matching `getauxval`).
pub fn read_auxv(pid: Pid) -> Result<AuxVec> {
    let filepath = PathBuf::from("/proc")
        .join(&format!("{}", pid))
        .join("auxv");
    let mut file = File::open(filepath)?;
    let mut bytes: Vec<u8> = Vec::new();
    file.read_to_end(&mut bytes)?;

    let mut entries: HashMap<u64, u64> = HashMap::new();
    for pair in bytes.chunks_exact(16) {
        let mut tag_bytes = [0u8; 8];
        let mut val_bytes = [0u8; 8];
        tag_bytes.copy_from_slice(&pair[..8]);
        val_bytes.copy_from_slice(&pair[8..]);
        let tag = u64::from_ne_bytes(tag_bytes);
        if tag == libc::AT_NULL {
            break;
        }
        entries.entry(tag).or_insert(u64::from_ne_bytes(val_bytes));
    }
    Ok(AuxVec { entries })
}

/// the target's argv[0], from `/proc/<pid>/cmdline`.
pub fn process_name(pid: Pid) -> Result<String> {
    procfs::process::Process::new(pid.as_raw())
        .and_then(|p| p.cmdline())
        .map_err(|e| Error::new(ErrorKind::Other, format!("{:?}", e)))?
        .into_iter()
        .next()
        .ok_or_else(|| {
            Error::new(ErrorKind::Other, format!("pid {} has empty cmdline", pid))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd;

    #[test]
    fn can_decode_proc_self_maps() -> Result<()> {
        let decoded = decode_proc_maps(unistd::getpid())?;
        assert!(decoded.len() > 0);
        Ok(())
    }

    #[test]
    fn maps_entries_are_sane_and_ordered() -> Result<()> {
        let decoded = decode_proc_maps(unistd::getpid())?;
        for ent in &decoded {
            assert!(ent.start < ent.end, "{:?}", ent);
            assert_eq!(ent.perms.len(), 4, "{:?}", ent);
        }
        for w in decoded.windows(2) {
            // ordered by start address and non-overlapping
            assert!(w[0].end <= w[1].start, "{:?} vs {:?}", w[0], w[1]);
        }
        Ok(())
    }

    #[test]
    fn can_parse_bracketed_pathname_with_spaces() {
        let line = "7000000000-7000001000 rw-p 00000000 00:00 0   [anon:scudo:primary reserve]";
        let ent = parse_proc_maps_entry(line).unwrap();
        assert_eq!(ent.start, 0x70_0000_0000);
        assert_eq!(ent.end, 0x70_0000_1000);
        assert_eq!(ent.perms, "rw-p");
        assert_eq!(ent.inode, 0);
        assert_eq!(
            ent.pathname.as_ref().map(String::as_str),
            Some("[anon:scudo:primary reserve]")
        );
    }

    #[test]
    fn can_parse_file_backed_entry() {
        let line =
            "55cc768cf000-55cc768d1000 r-xp 00002000 08:01 1835343 /usr/bin/cat";
        let ent = parse_proc_maps_entry(line).unwrap();
        assert_eq!(ent.offset, 0x2000);
        assert_eq!(ent.dev, 0x0801);
        assert_eq!(ent.inode, 1835343);
        assert!(ent.is_read());
        assert!(ent.is_exec());
        assert!(ent.is_file_backed());
        assert_eq!(ent.pathname.as_ref().map(String::as_str), Some("/usr/bin/cat"));
    }

    #[test]
    fn rejects_garbage_line() {
        assert!(parse_proc_maps_entry("not a maps line").is_err());
    }

    #[test]
    fn can_read_own_auxv() -> Result<()> {
        let auxv = read_auxv(unistd::getpid())?;
        assert!(auxv.require(libc::AT_PHDR)? != 0);
        assert!(auxv.require(libc::AT_PHNUM)? != 0);
        assert_eq!(auxv.require(libc::AT_PAGESZ)? % 4096, 0);
        Ok(())
    }

    #[test]
    fn own_process_name_is_test_binary() -> Result<()> {
        let name = process_name(unistd::getpid())?;
        assert!(!name.is_empty());
        Ok(())
    }
}
