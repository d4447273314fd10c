//! Tar entry header model.
//!
//! [`EntryHeader`] is what layer-file steps see and edit. It is decoded from a
//! `tar::Entry` with PAX overrides already applied, and re-encoded on top of the
//! original header block so that fields the model does not cover (format,
//! device numbers, checksum style, unmodelled PAX records) survive the rewrite.

use std::borrow::Cow;
use std::io::{self, Read, Write};

use chrono::{DateTime, Utc};
use imagemod_shared::errors::{ImageModError, ImageModResult};
use tar::{Builder, Entry, EntryType, Header};

use super::time::{TimeRule, fits_header, format_pax_time, header_secs, parse_pax_time};

const GNU_LONGLINK_NAME: &[u8] = b"././@LongLink";
const NAME_FIELD_LEN: usize = 100;

/// Header metadata of one tar entry.
///
/// Timestamps are `None` when the archive does not carry them ("zero").
#[derive(Debug, Clone)]
pub struct EntryHeader {
    pub name: String,
    pub link_name: Option<String>,
    pub entry_type: EntryType,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub uname: String,
    pub gname: String,
    /// Payload length; must match the content handed to the encoder.
    pub size: u64,
    pub mtime: Option<DateTime<Utc>>,
    pub atime: Option<DateTime<Utc>>,
    pub ctime: Option<DateTime<Utc>>,
    pub device_major: Option<u32>,
    pub device_minor: Option<u32>,
    /// PAX records as read, in archive order.
    pub pax: Vec<(String, Vec<u8>)>,
    raw: Header,
    raw_name: Vec<u8>,
    raw_link: Option<Vec<u8>>,
}

impl EntryHeader {
    /// Fresh header for a synthesized entry (GNU format, no timestamps).
    pub fn new(name: impl Into<String>, entry_type: EntryType, size: u64) -> Self {
        let mode = if entry_type.is_dir() { 0o755 } else { 0o644 };
        Self {
            name: name.into(),
            link_name: None,
            entry_type,
            mode,
            uid: 0,
            gid: 0,
            uname: String::new(),
            gname: String::new(),
            size,
            mtime: None,
            atime: None,
            ctime: None,
            device_major: None,
            device_minor: None,
            pax: Vec::new(),
            raw: Header::new_gnu(),
            raw_name: Vec::new(),
            raw_link: None,
        }
    }

    /// Decode the header of an archive entry.
    pub fn from_entry<R: Read>(entry: &mut Entry<'_, R>) -> ImageModResult<Self> {
        let raw_name = entry.path_bytes().into_owned();
        let name = String::from_utf8_lossy(&raw_name).into_owned();
        // The records of a global header are its body, which must stay unread.
        let pax = if is_pax_global(entry) {
            Vec::new()
        } else {
            read_pax(entry).map_err(|e| {
                ImageModError::Storage(format!("Failed to read PAX records of {}: {}", name, e))
            })?
        };
        let raw_link = entry.link_name_bytes().map(Cow::into_owned);
        let size = entry.size();
        let raw = entry.header().clone();

        let field_err = |field: &str, e: io::Error| {
            ImageModError::Storage(format!("Failed to read {} of {}: {}", field, name, e))
        };

        let old = raw.as_old();
        let mode = numeric(&old.mode, raw.mode()).map_err(|e| field_err("mode", e))?;
        let uid = match pax_number(&pax, "uid") {
            Some(uid) => uid,
            None => numeric(&old.uid, raw.uid()).map_err(|e| field_err("uid", e))?,
        };
        let gid = match pax_number(&pax, "gid") {
            Some(gid) => gid,
            None => numeric(&old.gid, raw.gid()).map_err(|e| field_err("gid", e))?,
        };
        let uname = match pax_value(&pax, "uname") {
            Some(v) => String::from_utf8_lossy(v).into_owned(),
            None => raw
                .username_bytes()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default(),
        };
        let gname = match pax_value(&pax, "gname") {
            Some(v) => String::from_utf8_lossy(v).into_owned(),
            None => raw
                .groupname_bytes()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default(),
        };

        let mtime = match pax_time(&pax, "mtime") {
            Some(t) => Some(t),
            None => {
                let secs = numeric(&old.mtime, raw.mtime()).map_err(|e| field_err("mtime", e))?;
                from_secs(secs)
            }
        };
        let atime = pax_time(&pax, "atime").or_else(|| gnu_time(&raw, true).and_then(from_secs));
        let ctime = pax_time(&pax, "ctime").or_else(|| gnu_time(&raw, false).and_then(from_secs));

        Ok(Self {
            link_name: raw_link
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).into_owned()),
            entry_type: raw.entry_type(),
            mode,
            uid,
            gid,
            uname,
            gname,
            size,
            mtime,
            atime,
            ctime,
            device_major: raw.device_major().unwrap_or(None),
            device_minor: raw.device_minor().unwrap_or(None),
            pax,
            raw,
            raw_name,
            raw_link,
            name,
        })
    }

    /// Whether this is a PAX global header, which applies to the archive as a
    /// whole and is copied through as-is.
    pub fn is_pax_global(&self) -> bool {
        self.entry_type.is_pax_global_extensions()
    }

    /// Apply a time rule to every non-zero timestamp. Returns true on any change.
    pub fn apply_times(&mut self, rule: &TimeRule) -> bool {
        let m = rule.apply(&mut self.mtime);
        let a = rule.apply(&mut self.atime);
        let c = rule.apply(&mut self.ctime);
        m || a || c
    }

    /// Name with leading `/` and `./` removed, for path comparisons.
    pub fn clean_name(&self) -> &str {
        let mut name = self.name.as_str();
        loop {
            if let Some(rest) = name.strip_prefix('/') {
                name = rest;
            } else if let Some(rest) = name.strip_prefix("./") {
                name = rest;
            } else {
                return name;
            }
        }
    }

    fn name_bytes(&self) -> &[u8] {
        if self.name == String::from_utf8_lossy(&self.raw_name) {
            &self.raw_name
        } else {
            self.name.as_bytes()
        }
    }

    fn link_bytes(&self) -> Option<&[u8]> {
        let link = self.link_name.as_ref()?;
        match &self.raw_link {
            Some(raw) if *link == String::from_utf8_lossy(raw) => Some(raw),
            _ => Some(link.as_bytes()),
        }
    }

    fn has_pax(&self, key: &str) -> bool {
        self.pax.iter().any(|(k, _)| k == key)
    }

    /// Encode this header and `content` into `builder`.
    ///
    /// Exactly `size` bytes must come out of `content`.
    pub fn append_to<W: Write, R: Read>(
        &self,
        builder: &mut Builder<W>,
        content: R,
    ) -> ImageModResult<()> {
        if self.entry_type.is_gnu_sparse() {
            return Err(ImageModError::Unsupported(format!(
                "Cannot re-encode sparse entry {}",
                self.name
            )));
        }
        let write_err = |e: io::Error| {
            ImageModError::Storage(format!("Failed to write entry {}: {}", self.name, e))
        };

        // Fields are only rewritten when they differ, so untouched entries keep
        // their original encoding.
        let mut hdr = self.raw.clone();
        hdr.set_entry_type(self.entry_type);
        if numeric(&hdr.as_old().mode, hdr.mode()).ok() != Some(self.mode) {
            hdr.set_mode(self.mode);
        }
        if !self.has_pax("uid") && numeric(&hdr.as_old().uid, hdr.uid()).ok() != Some(self.uid) {
            hdr.set_uid(self.uid);
        }
        if !self.has_pax("gid") && numeric(&hdr.as_old().gid, hdr.gid()).ok() != Some(self.gid) {
            hdr.set_gid(self.gid);
        }
        if !self.has_pax("size") && hdr.size().ok() != Some(self.size) {
            hdr.set_size(self.size);
        }
        let mtime_secs = self.mtime.as_ref().map(header_secs).unwrap_or(0);
        if numeric(&hdr.as_old().mtime, hdr.mtime()).ok() != Some(mtime_secs) {
            hdr.set_mtime(mtime_secs);
        }
        if let Some(major) = self.device_major
            && hdr.device_major().unwrap_or(None) != Some(major)
        {
            hdr.set_device_major(major).map_err(write_err)?;
        }
        if let Some(minor) = self.device_minor
            && hdr.device_minor().unwrap_or(None) != Some(minor)
        {
            hdr.set_device_minor(minor).map_err(write_err)?;
        }

        let uname_in_header = hdr.username_bytes() == Some(self.uname.as_bytes())
            || hdr.set_username(&self.uname).is_ok();
        let gname_in_header = hdr.groupname_bytes() == Some(self.gname.as_bytes())
            || hdr.set_groupname(&self.gname).is_ok();

        let gnu_atime = gnu_time(&self.raw, true).is_some();
        let gnu_ctime = gnu_time(&self.raw, false).is_some();
        if let Some(gnu) = hdr.as_gnu_mut() {
            let atime = self.atime.as_ref().map(header_secs).unwrap_or(0);
            if gnu_atime && gnu.atime().ok() != Some(atime) {
                gnu.set_atime(atime);
            }
            let ctime = self.ctime.as_ref().map(header_secs).unwrap_or(0);
            if gnu_ctime && gnu.ctime().ok() != Some(ctime) {
                gnu.set_ctime(ctime);
            }
        }

        let mut records = self.pax_records();
        let add = |key: &str, value: Vec<u8>, records: &mut Vec<(String, Vec<u8>)>| {
            if !records.iter().any(|(k, _)| k == key) {
                records.push((key.to_string(), value));
            }
        };
        if let Some(t) = &self.mtime
            && !fits_header(t)
        {
            add("mtime", format_pax_time(t).into_bytes(), &mut records);
        }
        if let Some(t) = &self.atime
            && !(gnu_atime && fits_header(t))
        {
            add("atime", format_pax_time(t).into_bytes(), &mut records);
        }
        if let Some(t) = &self.ctime
            && !(gnu_ctime && fits_header(t))
        {
            add("ctime", format_pax_time(t).into_bytes(), &mut records);
        }
        if !uname_in_header && !self.uname.is_empty() {
            add("uname", self.uname.clone().into_bytes(), &mut records);
        }
        if !gname_in_header && !self.gname.is_empty() {
            add("gname", self.gname.clone().into_bytes(), &mut records);
        }

        let name = self.name_bytes();
        if self.has_pax("path") {
            if hdr.path_bytes().as_ref() != name {
                set_name_field(&mut hdr, name);
            }
        } else if hdr.path_bytes().as_ref() != name {
            if name.len() > NAME_FIELD_LEN {
                append_gnu_long(builder, EntryType::GNULongName, name).map_err(write_err)?;
            }
            set_name_field(&mut hdr, name);
        }

        match self.link_bytes() {
            None => hdr.as_old_mut().linkname.fill(0),
            Some(link) => {
                let current = hdr.link_name_bytes().map(Cow::into_owned);
                if current.as_deref() != Some(link) {
                    if !self.has_pax("linkpath") && link.len() > NAME_FIELD_LEN {
                        append_gnu_long(builder, EntryType::GNULongLink, link)
                            .map_err(write_err)?;
                    }
                    write_field(&mut hdr.as_old_mut().linkname, link);
                }
            }
        }

        if !records.is_empty() {
            builder
                .append_pax_extensions(records.iter().map(|(k, v)| (k.as_str(), v.as_slice())))
                .map_err(write_err)?;
        }

        hdr.set_cksum();
        let exact = ExactReader {
            inner: content,
            remain: self.size,
        };
        builder.append(&hdr, exact).map_err(write_err)
    }

    /// Original PAX records with modelled keys regenerated from current values.
    fn pax_records(&self) -> Vec<(String, Vec<u8>)> {
        let mut out = Vec::with_capacity(self.pax.len());
        for (key, value) in &self.pax {
            let regenerated = match key.as_str() {
                "path" => Some(self.name_bytes().to_vec()),
                "linkpath" => match self.link_bytes() {
                    Some(link) => Some(link.to_vec()),
                    None => continue,
                },
                "size" => Some(self.size.to_string().into_bytes()),
                "uid" => Some(self.uid.to_string().into_bytes()),
                "gid" => Some(self.gid.to_string().into_bytes()),
                "uname" => Some(self.uname.clone().into_bytes()),
                "gname" => Some(self.gname.clone().into_bytes()),
                "mtime" => self.mtime.as_ref().map(|t| format_pax_time(t).into_bytes()),
                "atime" => self.atime.as_ref().map(|t| format_pax_time(t).into_bytes()),
                "ctime" => self.ctime.as_ref().map(|t| format_pax_time(t).into_bytes()),
                _ => Some(value.clone()),
            };
            if let Some(v) = regenerated {
                out.push((key.clone(), v));
            }
        }
        out
    }
}

/// Write the entry's name into the header block, dropping any ustar prefix.
fn set_name_field(hdr: &mut Header, name: &[u8]) {
    if let Some(ustar) = hdr.as_ustar_mut() {
        ustar.prefix.fill(0);
    }
    write_field(&mut hdr.as_old_mut().name, name);
}

fn write_field(field: &mut [u8], bytes: &[u8]) {
    field.fill(0);
    let n = bytes.len().min(field.len());
    field[..n].copy_from_slice(&bytes[..n]);
}

fn append_gnu_long<W: Write>(
    builder: &mut Builder<W>,
    kind: EntryType,
    bytes: &[u8],
) -> io::Result<()> {
    let mut data = Vec::with_capacity(bytes.len() + 1);
    data.extend_from_slice(bytes);
    data.push(0);

    let mut hdr = Header::new_gnu();
    write_field(&mut hdr.as_old_mut().name, GNU_LONGLINK_NAME);
    hdr.set_mode(0o644);
    hdr.set_uid(0);
    hdr.set_gid(0);
    hdr.set_mtime(0);
    hdr.set_size(data.len() as u64);
    hdr.set_entry_type(kind);
    hdr.set_cksum();
    builder.append(&hdr, data.as_slice())
}

/// GNU atime or ctime; a field starting with NUL is absent, a written zero is the epoch.
fn gnu_time(raw: &Header, atime: bool) -> Option<u64> {
    let gnu = raw.as_gnu()?;
    let (field, value) = if atime {
        (&gnu.atime, gnu.atime())
    } else {
        (&gnu.ctime, gnu.ctime())
    };
    if field[0] == 0 {
        return None;
    }
    value.ok()
}

/// Numeric header field with a blank (all NUL or space) field read as 0.
fn numeric<T: Default>(field: &[u8], parsed: io::Result<T>) -> io::Result<T> {
    match parsed {
        Err(_) if field.iter().all(|&b| b == 0 || b == b' ') => Ok(T::default()),
        other => other,
    }
}

fn is_pax_global<R: Read>(entry: &Entry<'_, R>) -> bool {
    entry.header().entry_type().is_pax_global_extensions()
}

/// Copy a PAX global header entry, header block and records, unchanged.
pub fn copy_pax_global<W: Write, R: Read>(
    builder: &mut Builder<W>,
    entry: &mut Entry<'_, R>,
) -> ImageModResult<()> {
    let hdr = entry.header().clone();
    builder.append(&hdr, entry).map_err(|e| {
        ImageModError::Storage(format!("Failed to copy PAX global header: {}", e))
    })
}

fn read_pax<R: Read>(entry: &mut Entry<'_, R>) -> io::Result<Vec<(String, Vec<u8>)>> {
    let Some(extensions) = entry.pax_extensions()? else {
        return Ok(Vec::new());
    };
    extensions
        .map(|ext| {
            let ext = ext?;
            Ok((
                String::from_utf8_lossy(ext.key_bytes()).into_owned(),
                ext.value_bytes().to_vec(),
            ))
        })
        .collect()
}

fn pax_value<'a>(pax: &'a [(String, Vec<u8>)], key: &str) -> Option<&'a [u8]> {
    pax.iter()
        .rev()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_slice())
}

fn pax_number(pax: &[(String, Vec<u8>)], key: &str) -> Option<u64> {
    std::str::from_utf8(pax_value(pax, key)?).ok()?.parse().ok()
}

fn pax_time(pax: &[(String, Vec<u8>)], key: &str) -> Option<DateTime<Utc>> {
    parse_pax_time(std::str::from_utf8(pax_value(pax, key)?).ok()?)
}

fn from_secs(secs: u64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(i64::try_from(secs).ok()?, 0)
}

/// Yields exactly `remain` bytes, failing on a short or long source.
struct ExactReader<R> {
    inner: R,
    remain: u64,
}

impl<R: Read> Read for ExactReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.remain == 0 {
            let mut extra = [0u8; 1];
            return match self.inner.read(&mut extra)? {
                0 => Ok(0),
                _ => Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "content longer than header size",
                )),
            };
        }
        let max = buf.len().min(usize::try_from(self.remain).unwrap_or(usize::MAX));
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("content ended {} bytes short of header size", self.remain),
            ));
        }
        self.remain -= n as u64;
        Ok(n)
    }
}
