//! POSIX ustar record encoding.
//!
//! Values that do not fit the classic fields are still encoded: numbers use
//! the GNU base-256 form, and long names or link targets are carried in a
//! PAX extended header (`x`) written ahead of the entry.

pub const BLOCK_SIZE: usize = 512;

const NAME_LEN: usize = 100;
const PREFIX_LEN: usize = 155;
const PAX_NAME: &str = "././@PaxHeader";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Regular,
    Symlink,
    Directory,
    PaxExtended,
}

impl EntryType {
    fn flag(self) -> u8 {
        match self {
            EntryType::Regular => b'0',
            EntryType::Symlink => b'2',
            EntryType::Directory => b'5',
            EntryType::PaxExtended => b'x',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub entry_type: EntryType,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub size: u64,
    pub mtime: u64,
    pub link_name: String,
}

impl Header {
    /// Encode the entry's header blocks: an optional PAX record, then the
    /// ustar header. File content is not included.
    pub fn encode(&self) -> Vec<u8> {
        let mut name = self.name.clone();
        if self.entry_type == EntryType::Directory && !name.ends_with('/') {
            name.push('/');
        }

        let mut records = Vec::new();
        let split = split_name(&name);
        if split.is_none() {
            pax_record(&mut records, "path", &name);
        }
        if self.link_name.len() > NAME_LEN {
            pax_record(&mut records, "linkpath", &self.link_name);
        }

        let mut out = Vec::with_capacity(BLOCK_SIZE);
        if !records.is_empty() {
            let pax = Header {
                name: PAX_NAME.to_string(),
                entry_type: EntryType::PaxExtended,
                mode: 0o644,
                uid: 0,
                gid: 0,
                size: records.len() as u64,
                mtime: self.mtime,
                link_name: String::new(),
            };
            out.extend_from_slice(&pax.block("", PAX_NAME, ""));
            out.extend_from_slice(&records);
            out.resize(out.len() + padding(records.len() as u64), 0);
        }

        let (prefix, short) = split.unwrap_or(("", truncate(&name, NAME_LEN)));
        let link = truncate(&self.link_name, NAME_LEN);
        out.extend_from_slice(&self.block(prefix, short, link));
        out
    }

    fn block(&self, prefix: &str, name: &str, link: &str) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        block[..name.len()].copy_from_slice(name.as_bytes());
        block[345..345 + prefix.len()].copy_from_slice(prefix.as_bytes());

        write_numeric(&mut block[100..108], u64::from(self.mode & 0o7777));
        write_numeric(&mut block[108..116], self.uid);
        write_numeric(&mut block[116..124], self.gid);
        write_numeric(&mut block[124..136], self.size);
        write_numeric(&mut block[136..148], self.mtime);
        block[156] = self.entry_type.flag();
        block[157..157 + link.len()].copy_from_slice(link.as_bytes());

        block[257..263].copy_from_slice(b"ustar\0");
        block[263..265].copy_from_slice(b"00");

        block[148..156].fill(b' ');
        let sum: u64 = block.iter().map(|b| u64::from(*b)).sum();
        let chksum = format!("{sum:06o}\0 ");
        block[148..156].copy_from_slice(chksum.as_bytes());
        block
    }
}

/// Zero bytes needed after `size` bytes of content to reach a block boundary.
pub fn padding(size: u64) -> usize {
    let rem = (size % BLOCK_SIZE as u64) as usize;
    if rem == 0 {
        0
    } else {
        BLOCK_SIZE - rem
    }
}

/// The two zero blocks closing an archive.
pub fn trailer() -> [u8; 2 * BLOCK_SIZE] {
    [0u8; 2 * BLOCK_SIZE]
}

/// Split `path` into ustar prefix and name fields, if it fits them.
fn split_name(path: &str) -> Option<(&str, &str)> {
    if path.len() <= NAME_LEN {
        return Some(("", path));
    }
    let trimmed = path.trim_end_matches('/');
    trimmed.match_indices('/').find_map(|(idx, _)| {
        let (prefix, rest) = (&path[..idx], &path[idx + 1..]);
        (prefix.len() <= PREFIX_LEN && rest.len() <= NAME_LEN && !rest.is_empty())
            .then_some((prefix, rest))
    })
}

/// Longest prefix of `s` within `max` bytes, cut at a char boundary.
fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Append one `"<len> <key>=<value>\n"` record, where `len` counts itself.
fn pax_record(out: &mut Vec<u8>, key: &str, value: &str) {
    let base = key.len() + value.len() + 3;
    let mut len = base + 1;
    while base + len.to_string().len() != len {
        len = base + len.to_string().len();
    }
    out.extend_from_slice(format!("{len} {key}={value}\n").as_bytes());
}

/// Octal when the value fits, GNU base-256 otherwise.
fn write_numeric(field: &mut [u8], value: u64) {
    let digits = field.len() - 1;
    let text = format!("{value:0digits$o}");
    if text.len() <= digits {
        field[..digits].copy_from_slice(text.as_bytes());
        field[digits] = 0;
        return;
    }
    // Big-endian in the field, first byte flagged. The 8-byte fields hold
    // 56 bits, which covers every uid and gid.
    field.fill(0);
    let bytes = value.to_be_bytes();
    let width = bytes.len().min(field.len() - 1);
    let start = field.len() - width;
    field[start..].copy_from_slice(&bytes[bytes.len() - width..]);
    field[0] |= 0x80;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(name: &str, entry_type: EntryType) -> Header {
        Header {
            name: name.to_string(),
            entry_type,
            mode: 0o644,
            uid: 0,
            gid: 0,
            size: 3,
            mtime: 1_500_000_000,
            link_name: String::new(),
        }
    }

    #[test]
    fn test_encode_regular() {
        let block = header("etc/hosts", EntryType::Regular).encode();
        assert_eq!(&block[..9], b"etc/hosts");
        assert_eq!(block[9], 0);
        assert_eq!(&block[124..136], b"00000000003\0");
        assert_eq!(block[156], b'0');
        assert_eq!(&block[257..263], b"ustar\0");

        // checksum is computed over the block with the checksum field as spaces
        let mut copy = block.clone();
        copy[148..156].fill(b' ');
        let sum: u64 = copy.iter().map(|b| u64::from(*b)).sum();
        let stored = std::str::from_utf8(&block[148..154]).unwrap();
        assert_eq!(u64::from_str_radix(stored, 8).unwrap(), sum);
    }

    #[test]
    fn test_directory_gets_trailing_slash() {
        let block = header("var/log", EntryType::Directory).encode();
        assert_eq!(&block[..8], b"var/log/");
        assert_eq!(block[156], b'5');
    }

    #[test]
    fn test_long_name_uses_prefix() {
        let dir = "d".repeat(120);
        let name = format!("{dir}/file.txt");
        let block = header(&name, EntryType::Regular).encode();
        assert_eq!(&block[..8], b"file.txt");
        assert_eq!(&block[345..465], dir.as_bytes());
    }

    #[test]
    fn test_unsplittable_name_goes_to_pax() {
        let name = "x".repeat(200);
        let out = header(&name, EntryType::Regular).encode();
        assert_eq!(out.len(), 3 * BLOCK_SIZE);

        assert_eq!(out[156], b'x');
        let record = format!("210 path={name}\n");
        assert_eq!(&out[124..136], format!("{:011o}\0", record.len()).as_bytes());
        assert_eq!(&out[BLOCK_SIZE..BLOCK_SIZE + record.len()], record.as_bytes());

        let entry = &out[2 * BLOCK_SIZE..];
        assert_eq!(&entry[..NAME_LEN], "x".repeat(NAME_LEN).as_bytes());
        assert_eq!(entry[156], b'0');
    }

    #[test]
    fn test_long_link_target_goes_to_pax() {
        let mut h = header("lib/libc.so", EntryType::Symlink);
        h.size = 0;
        h.link_name = format!("/opt/{}/libc.so.6", "v".repeat(120));
        let out = h.encode();
        assert_eq!(out[156], b'x');
        let records = std::str::from_utf8(&out[BLOCK_SIZE..2 * BLOCK_SIZE]).unwrap();
        assert!(records.contains(&format!(" linkpath={}\n", h.link_name)));
        assert!(!records.contains(" path="));

        let entry = &out[out.len() - BLOCK_SIZE..];
        assert_eq!(&entry[..11], b"lib/libc.so");
        assert_eq!(entry[156], b'2');
    }

    #[test]
    fn test_large_size_uses_base256() {
        let mut h = header("db.bin", EntryType::Regular);
        h.size = 9 << 30;
        h.uid = 1 << 22;
        let out = h.encode();
        assert_eq!(out.len(), BLOCK_SIZE);

        let size = &out[124..136];
        assert_eq!(size[0], 0x80);
        let value = size[4..]
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
        assert_eq!(value, 9 << 30);
        assert!(size[1..4].iter().all(|b| *b == 0));

        let uid = &out[108..116];
        assert_eq!(uid[0], 0x80);
        let value = uid[1..]
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
        assert_eq!(value, 1 << 22);
    }

    #[test]
    fn test_padding() {
        assert_eq!(padding(0), 0);
        assert_eq!(padding(1), 511);
        assert_eq!(padding(512), 0);
        assert_eq!(padding(513), 511);
    }
}
