// Copyright 2023 the Tectonic Project
// Licensed under the MIT License

//! The on-disk metadata record format.
//!
//! A metadata entry binds a rule digest to the complete list of outputs of
//! one rule execution. The canonical form is ASCII, self-delimited, and
//! deliberately dull: parenthesized lists of length-prefixed tokens, each
//! token written as `<len>:<bytes>`. An artifacts record looks like
//!
//! ```text
//! ((8:metadata)(5:files(8:some.out32:<hex digest>)(5:other32:<hex digest>)))
//! ```
//!
//! The format admits a second record kind, `value`, whose payload is a single
//! opaque token. Value records are reserved: readers keep them, the trimmer
//! never treats them as references to file entries, and they are never
//! promoted to hard links.
//!
//! Records are small, typically well under 200 bytes.

use std::str;
use tectonic_errors::prelude::*;

use crate::digest::DigestData;

/// One output file referenced by a metadata record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileRef {
    /// The target's basename relative to the rule's build directory.
    pub name: String,

    /// The digest naming the file entry holding the target's content.
    pub digest: DigestData,
}

/// The payload of a metadata record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MetadataPayload {
    /// The ordered outputs of a rule execution.
    Files(Vec<FileRef>),

    /// A reserved opaque record.
    Value(Vec<u8>),
}

impl MetadataPayload {
    /// Serialize this record into its canonical byte form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);

        out.push(b'(');
        out.push(b'(');
        push_token(&mut out, b"metadata");
        out.push(b')');
        out.push(b'(');

        match self {
            MetadataPayload::Files(files) => {
                push_token(&mut out, b"files");

                for fref in files {
                    out.push(b'(');
                    push_token(&mut out, fref.name.as_bytes());
                    push_token(&mut out, fref.digest.to_hex().as_bytes());
                    out.push(b')');
                }
            }

            MetadataPayload::Value(payload) => {
                push_token(&mut out, b"value");
                push_token(&mut out, payload);
            }
        }

        out.push(b')');
        out.push(b')');
        out
    }

    /// Parse a record from its canonical byte form.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut scanner = Scanner::new(data);

        scanner.expect(b'(')?;
        scanner.expect(b'(')?;

        let header = scanner.token()?;
        ensure!(
            header == b"metadata",
            "malformed metadata record: expected a `metadata` header, got {:?}",
            String::from_utf8_lossy(header)
        );
        scanner.expect(b')')?;

        scanner.expect(b'(')?;
        let kind = scanner.token()?;

        let payload = match kind {
            b"files" => {
                let mut files = Vec::new();

                while scanner.peek()? != b')' {
                    scanner.expect(b'(')?;
                    let name = parse_target_name(scanner.token()?)?;
                    let digest = parse_digest_token(scanner.token()?)?;
                    scanner.expect(b')')?;
                    files.push(FileRef { name, digest });
                }

                MetadataPayload::Files(files)
            }

            b"value" => MetadataPayload::Value(scanner.token()?.to_owned()),

            other => bail!(
                "malformed metadata record: unknown payload kind {:?}",
                String::from_utf8_lossy(other)
            ),
        };

        scanner.expect(b')')?;
        scanner.expect(b')')?;
        scanner.finish()?;
        Ok(payload)
    }
}

fn push_token(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}

fn parse_target_name(token: &[u8]) -> Result<String> {
    let name = atry!(
        str::from_utf8(token).map(str::to_owned);
        ["malformed metadata record: target name is not UTF-8"]
    );

    ensure!(
        !name.is_empty(),
        "malformed metadata record: empty target name"
    );
    ensure!(
        !name.contains('/') && !name.contains('\\'),
        "malformed metadata record: target name {:?} contains a path separator",
        name
    );

    Ok(name)
}

fn parse_digest_token(token: &[u8]) -> Result<DigestData> {
    let text = str::from_utf8(token).ok();

    Ok(a_ok_or!(
        text.and_then(DigestData::from_hex);
        ["malformed metadata record: {:?} is not a canonical digest",
         String::from_utf8_lossy(token)]
    ))
}

/// A cursor over the raw record bytes. All lookahead is a single byte; the
/// token length prefixes make everything else self-delimiting.
struct Scanner<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(data: &'a [u8]) -> Self {
        Scanner { data, pos: 0 }
    }

    fn peek(&self) -> Result<u8> {
        match self.data.get(self.pos) {
            Some(b) => Ok(*b),
            None => bail!("malformed metadata record: truncated at byte {}", self.pos),
        }
    }

    fn expect(&mut self, wanted: u8) -> Result<()> {
        let got = self.peek()?;
        ensure!(
            got == wanted,
            "malformed metadata record: expected {:?} at byte {}, got {:?}",
            wanted as char,
            self.pos,
            got as char
        );
        self.pos += 1;
        Ok(())
    }

    /// Read one length-prefixed token: decimal digits, a colon, then exactly
    /// that many payload bytes.
    fn token(&mut self) -> Result<&'a [u8]> {
        let mut len: usize = 0;
        let digits_start = self.pos;

        loop {
            match self.peek()? {
                b @ b'0'..=b'9' => {
                    len = a_ok_or!(
                        len.checked_mul(10).and_then(|l| l.checked_add((b - b'0') as usize));
                        ["malformed metadata record: oversized token length at byte {}", digits_start]
                    );
                    self.pos += 1;
                }

                b':' => {
                    ensure!(
                        self.pos > digits_start,
                        "malformed metadata record: token at byte {} has no length",
                        digits_start
                    );
                    self.pos += 1;
                    break;
                }

                other => bail!(
                    "malformed metadata record: unexpected byte {:?} at {} while reading a token length",
                    other as char,
                    self.pos
                ),
            }
        }

        let end = a_ok_or!(
            self.pos.checked_add(len).filter(|e| *e <= self.data.len());
            ["malformed metadata record: token at byte {} overruns the record", digits_start]
        );

        let token = &self.data[self.pos..end];
        self.pos = end;
        Ok(token)
    }

    fn finish(&self) -> Result<()> {
        ensure!(
            self.pos == self.data.len(),
            "malformed metadata record: {} trailing bytes",
            self.data.len() - self.pos
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_digest() -> DigestData {
        DigestData::from_hex("d41d8cd98f00b204e9800998ecf8427e").unwrap()
    }

    #[test]
    fn canonical_encoding() {
        let payload = MetadataPayload::Files(vec![FileRef {
            name: "a.out".into(),
            digest: sample_digest(),
        }]);

        assert_eq!(
            payload.encode(),
            b"((8:metadata)(5:files(5:a.out32:d41d8cd98f00b204e9800998ecf8427e)))".to_vec()
        );
    }

    #[test]
    fn round_trip() {
        let payload = MetadataPayload::Files(vec![
            FileRef {
                name: "lib.cma".into(),
                digest: sample_digest(),
            },
            FileRef {
                name: "lib.cmi".into(),
                digest: DigestData::of_bytes(b"other"),
            },
        ]);

        assert_eq!(MetadataPayload::parse(&payload.encode()).unwrap(), payload);

        let empty = MetadataPayload::Files(Vec::new());
        assert_eq!(MetadataPayload::parse(&empty.encode()).unwrap(), empty);
    }

    #[test]
    fn value_records_are_tolerated() {
        let payload = MetadataPayload::Value(b"opaque payload".to_vec());
        let encoded = payload.encode();

        assert_eq!(
            encoded,
            b"((8:metadata)(5:value14:opaque payload))".to_vec()
        );
        assert_eq!(MetadataPayload::parse(&encoded).unwrap(), payload);
    }

    #[test]
    fn malformed_records() {
        let good = MetadataPayload::Files(vec![FileRef {
            name: "a.out".into(),
            digest: sample_digest(),
        }])
        .encode();

        // Truncations anywhere are errors.
        for cut in 1..good.len() {
            assert!(MetadataPayload::parse(&good[..cut]).is_err());
        }

        // Trailing garbage is an error.
        let mut traily = good.clone();
        traily.push(b' ');
        assert!(MetadataPayload::parse(&traily).is_err());

        assert!(MetadataPayload::parse(b"").is_err());
        assert!(MetadataPayload::parse(b"((8:metadata)(4:junk))").is_err());
        assert!(MetadataPayload::parse(b"((7:metadat)(5:files))").is_err());

        // Digest tokens must be canonical-width hex.
        assert!(
            MetadataPayload::parse(b"((8:metadata)(5:files(5:a.out5:d41d8)))").is_err()
        );

        // Target names must not contain path separators.
        assert!(MetadataPayload::parse(
            b"((8:metadata)(5:files(7:../a.out32:d41d8cd98f00b204e9800998ecf8427e)))"
        )
        .is_err());
    }
}
