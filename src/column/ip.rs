use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::{Column, ConverterError};
use crate::error::Result;
use crate::proto::{byte_len, Decoder, Encoder};
use crate::types::Value;

/// `ipv4`: the address as a little-endian u32.
#[derive(Debug, Clone)]
pub struct Ipv4 {
    type_name: String,
    data: Vec<u32>,
}

impl Ipv4 {
    pub fn new(type_name: &str) -> Self {
        Ipv4 {
            type_name: type_name.to_string(),
            data: Vec::new(),
        }
    }
}

impl Column for Ipv4 {
    fn column_type(&self) -> &str {
        &self.type_name
    }

    fn rows(&self) -> usize {
        self.data.len()
    }

    fn row(&self, i: usize) -> Value {
        Value::Ipv4(Ipv4Addr::from(self.data[i]))
    }

    fn append_row(&mut self, value: &Value) -> std::result::Result<(), ConverterError> {
        let ip = match value {
            Value::Ipv4(ip) => Some(*ip),
            Value::Ipv6(ip) => ip.to_ipv4_mapped(),
            Value::String(s) => s.parse::<Ipv4Addr>().ok(),
            Value::UInt32(v) => Some(Ipv4Addr::from(*v)),
            _ => None,
        };
        let ip = ip.ok_or_else(|| ConverterError::append(value, &self.type_name))?;
        self.data.push(u32::from(ip));
        Ok(())
    }

    fn append_default(&mut self) {
        self.data.push(0);
    }

    fn truncate(&mut self, rows: usize) {
        self.data.truncate(rows);
    }

    fn decode(&mut self, decoder: &mut Decoder<'_>, rows: usize) -> Result<()> {
        self.data.reserve(decoder.capacity_hint(rows, 4));
        for _ in 0..rows {
            self.data.push(decoder.u32()?);
        }
        Ok(())
    }

    fn encode(&self, encoder: &mut Encoder) {
        for v in &self.data {
            encoder.u32(*v);
        }
    }

    fn new_empty(&self) -> Box<dyn Column> {
        Box::new(Ipv4::new(&self.type_name))
    }
}

/// `ipv6`: sixteen bytes in network order.
#[derive(Debug, Clone)]
pub struct Ipv6 {
    type_name: String,
    data: Vec<[u8; 16]>,
}

impl Ipv6 {
    pub fn new(type_name: &str) -> Self {
        Ipv6 {
            type_name: type_name.to_string(),
            data: Vec::new(),
        }
    }
}

impl Column for Ipv6 {
    fn column_type(&self) -> &str {
        &self.type_name
    }

    fn rows(&self) -> usize {
        self.data.len()
    }

    fn row(&self, i: usize) -> Value {
        Value::Ipv6(Ipv6Addr::from(self.data[i]))
    }

    fn append_row(&mut self, value: &Value) -> std::result::Result<(), ConverterError> {
        let ip = match value {
            Value::Ipv6(ip) => Some(*ip),
            Value::Ipv4(ip) => Some(ip.to_ipv6_mapped()),
            Value::String(s) => match s.parse::<IpAddr>() {
                Ok(IpAddr::V6(ip)) => Some(ip),
                Ok(IpAddr::V4(ip)) => Some(ip.to_ipv6_mapped()),
                Err(_) => None,
            },
            _ => None,
        };
        let ip = ip.ok_or_else(|| ConverterError::append(value, &self.type_name))?;
        self.data.push(ip.octets());
        Ok(())
    }

    fn append_default(&mut self) {
        self.data.push([0; 16]);
    }

    fn truncate(&mut self, rows: usize) {
        self.data.truncate(rows);
    }

    fn decode(&mut self, decoder: &mut Decoder<'_>, rows: usize) -> Result<()> {
        let raw = decoder.take(byte_len(rows, 16)?)?;
        self.data.extend(raw.chunks_exact(16).map(|chunk| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(chunk);
            octets
        }));
        Ok(())
    }

    fn encode(&self, encoder: &mut Encoder) {
        for octets in &self.data {
            encoder.raw(octets);
        }
    }

    fn new_empty(&self) -> Box<dyn Column> {
        Box::new(Ipv6::new(&self.type_name))
    }
}
