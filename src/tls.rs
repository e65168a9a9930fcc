// src/tls.rs - ClientHello parsing for SNI extraction
use crate::error::SniffError;

pub const TLS_HANDSHAKE: u8 = 0x16;
const CLIENT_HELLO: u8 = 0x01;
const RECORD_HEADER_LEN: usize = 5;
const EXT_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST: u8 = 0x00;

#[derive(Debug, Clone)]
pub struct TlsClientHello {
    pub version: [u8; 2],
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
    pub cipher_suites: Vec<u16>,
    pub compression_methods: Vec<u8>,
    pub extensions: Vec<TlsExtension>,
}

#[derive(Debug, Clone)]
pub struct TlsExtension {
    pub extension_type: u16,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub enum TlsProbe {
    /// First byte is not a handshake record.
    NotTls,
    /// Looks like TLS but the first record has not fully arrived.
    Incomplete,
    Hello(Box<TlsClientHello>),
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], SniffError> {
        let end = self.pos.checked_add(n).ok_or(SniffError::TruncatedHandshake)?;
        let slice = self.data.get(self.pos..end).ok_or(SniffError::TruncatedHandshake)?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, SniffError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, SniffError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Result<usize, SniffError> {
        let b = self.take(3)?;
        Ok(((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize)
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

impl TlsClientHello {
    /// Parses one complete handshake record holding a ClientHello.
    pub fn parse(record: &[u8]) -> Result<Self, SniffError> {
        let mut rec = Reader::new(record);
        if rec.u8()? != TLS_HANDSHAKE {
            return Err(SniffError::NotClientHello);
        }
        rec.take(2)?;
        let record_len = rec.u16()? as usize;
        let body = rec.take(record_len)?;

        let mut hs = Reader::new(body);
        if hs.u8()? != CLIENT_HELLO {
            return Err(SniffError::NotClientHello);
        }
        let hello_len = hs.u24()?;
        let mut r = Reader::new(hs.take(hello_len)?);

        let v = r.take(2)?;
        let version = [v[0], v[1]];
        let mut random = [0u8; 32];
        random.copy_from_slice(r.take(32)?);

        let session_id_len = r.u8()? as usize;
        let session_id = r.take(session_id_len)?.to_vec();

        let suites_len = r.u16()? as usize;
        let cipher_suites = r
            .take(suites_len)?
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();

        let compression_len = r.u8()? as usize;
        let compression_methods = r.take(compression_len)?.to_vec();

        let mut extensions = Vec::new();
        // Extensions are optional in a minimal hello.
        if r.remaining() >= 2 {
            let ext_len = r.u16()? as usize;
            let mut ext = Reader::new(r.take(ext_len)?);
            while ext.remaining() >= 4 {
                let extension_type = ext.u16()?;
                let len = ext.u16()? as usize;
                extensions.push(TlsExtension {
                    extension_type,
                    data: ext.take(len)?.to_vec(),
                });
            }
        }

        Ok(Self {
            version,
            random,
            session_id,
            cipher_suites,
            compression_methods,
            extensions,
        })
    }

    /// The first `host_name` entry of the server_name extension.
    pub fn server_name(&self) -> Option<String> {
        let ext = self
            .extensions
            .iter()
            .find(|e| e.extension_type == EXT_SERVER_NAME)?;

        let mut r = Reader::new(&ext.data);
        let list_len = r.u16().ok()? as usize;
        let mut list = Reader::new(r.take(list_len).ok()?);
        while list.remaining() >= 3 {
            let name_type = list.u8().ok()?;
            let len = list.u16().ok()? as usize;
            let name = list.take(len).ok()?;
            if name_type == NAME_TYPE_HOST {
                return std::str::from_utf8(name)
                    .ok()
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_ascii_lowercase());
            }
        }
        None
    }
}

/// Inspects the start of a client byte stream.
pub fn probe(data: &[u8]) -> Result<TlsProbe, SniffError> {
    match data.first() {
        None => return Ok(TlsProbe::Incomplete),
        Some(&b) if b != TLS_HANDSHAKE => return Ok(TlsProbe::NotTls),
        Some(_) => {}
    }
    if data.len() < RECORD_HEADER_LEN {
        return Ok(TlsProbe::Incomplete);
    }
    let record_len = u16::from_be_bytes([data[3], data[4]]) as usize;
    let total = RECORD_HEADER_LEN + record_len;
    if data.len() < total {
        return Ok(TlsProbe::Incomplete);
    }
    TlsClientHello::parse(&data[..total]).map(|hello| TlsProbe::Hello(Box::new(hello)))
}
