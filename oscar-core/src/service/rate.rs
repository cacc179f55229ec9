//! Server-announced rate classes and the client-side throttle.
//!
//! Each class tracks a moving-average "level" of the time between sends:
//!
//! ```text
//! new = (window - 1) / window * old + elapsed_ms / window
//! ```
//!
//! Sending too fast drags the level down through alert, limit and
//! disconnect thresholds. The throttle delays a send until the projected
//! level stays at or above the alert level plus a configured margin.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::buffer::{ByteReader, ByteWriter};
use crate::error::OscarError;

/// Encoded size of one class in a rate reply or change notice.
pub const RATE_CLASS_LEN: usize = 35;

// ── RateClass ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateClass {
    pub id: u16,
    pub window: u32,
    pub clear: u32,
    pub alert: u32,
    pub limit: u32,
    pub disconnect: u32,
    pub current: u32,
    pub max: u32,
    /// Milliseconds since the last send, as reported by the server.
    pub last_delta: u32,
    pub state: u8,
    last_send: Instant,
}

impl RateClass {
    pub fn read(r: &mut ByteReader<'_>) -> Result<Self, OscarError> {
        Ok(Self {
            id: r.read_u16()?,
            window: r.read_u32()?,
            clear: r.read_u32()?,
            alert: r.read_u32()?,
            limit: r.read_u32()?,
            disconnect: r.read_u32()?,
            current: r.read_u32()?,
            max: r.read_u32()?,
            last_delta: r.read_u32()?,
            state: r.read_u8()?,
            last_send: Instant::now(),
        })
    }

    pub fn write(&self, w: &mut ByteWriter) {
        w.write_u16(self.id)
            .write_u32(self.window)
            .write_u32(self.clear)
            .write_u32(self.alert)
            .write_u32(self.limit)
            .write_u32(self.disconnect)
            .write_u32(self.current)
            .write_u32(self.max)
            .write_u32(self.last_delta)
            .write_u8(self.state);
    }

    fn window(&self) -> u64 {
        u64::from(self.window.max(1))
    }

    /// The level this class would reach if a send happened at `now`.
    pub fn projected_level(&self, now: Instant) -> u32 {
        let elapsed = now.saturating_duration_since(self.last_send).as_millis() as u64;
        let window = self.window();
        let level = ((window - 1) * u64::from(self.current) + elapsed) / window;
        level.min(u64::from(self.max)) as u32
    }

    /// How long to wait before a send keeps the level at or above `target`.
    pub fn delay_to_reach(&self, target: u32, now: Instant) -> Duration {
        let target = target.min(self.max);
        if self.projected_level(now) >= target {
            return Duration::ZERO;
        }
        let window = self.window();
        let needed = (u64::from(target) * window)
            .saturating_sub((window - 1) * u64::from(self.current));
        let elapsed = now.saturating_duration_since(self.last_send).as_millis() as u64;
        Duration::from_millis(needed.saturating_sub(elapsed))
    }

    /// Account for a send at `now`.
    pub fn record(&mut self, now: Instant) {
        self.current = self.projected_level(now);
        self.last_send = now;
    }

    /// Take the server's thresholds and level, keeping local timing.
    fn update_from(&mut self, other: RateClass) {
        let last_send = self.last_send;
        *self = other;
        self.last_send = last_send;
    }
}

// ── RateChange ───────────────────────────────────────────────────

/// Code word of a rate change notice.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateChangeCode {
    Changed = 0x0001,
    Warning = 0x0002,
    Limited = 0x0003,
    Clear = 0x0004,
}

impl TryFrom<u16> for RateChangeCode {
    type Error = OscarError;

    fn try_from(value: u16) -> Result<Self, OscarError> {
        match value {
            0x0001 => Ok(Self::Changed),
            0x0002 => Ok(Self::Warning),
            0x0003 => Ok(Self::Limited),
            0x0004 => Ok(Self::Clear),
            _ => Err(OscarError::UnknownVariant {
                type_name: "RateChangeCode",
                value: value as u32,
            }),
        }
    }
}

impl RateChangeCode {
    /// Warnings and limits are worth telling the caller about.
    pub fn is_alarming(self) -> bool {
        matches!(self, Self::Warning | Self::Limited)
    }
}

// ── RateTable ────────────────────────────────────────────────────

/// All rate classes of one connection plus the sub-message pairs they cover.
#[derive(Debug, Clone, Default)]
pub struct RateTable {
    classes: HashMap<u16, RateClass>,
    members: HashMap<(u16, u16), u16>,
}

impl RateTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a rate-parameters reply body.
    pub fn from_reply(body: &[u8]) -> Result<Self, OscarError> {
        let mut r = ByteReader::new(body);
        let count = r.read_u16()? as usize;
        let mut table = Self::new();
        for _ in 0..count {
            let class = RateClass::read(&mut r)?;
            table.classes.insert(class.id, class);
        }
        // Membership groups are optional trailing data.
        while r.remaining() >= 4 {
            let id = r.read_u16()?;
            let pairs = r.read_u16()?;
            for _ in 0..pairs {
                let family = r.read_u16()?;
                let subtype = r.read_u16()?;
                table.members.insert((family, subtype), id);
            }
        }
        Ok(table)
    }

    /// Encode as a rate-parameters reply body.
    pub fn to_reply(&self) -> ByteWriter {
        let mut w = ByteWriter::new();
        let ids = self.class_ids();
        w.write_u16(ids.len() as u16);
        for id in &ids {
            if let Some(class) = self.classes.get(id) {
                class.write(&mut w);
            }
        }
        for id in &ids {
            let mut pairs: Vec<_> = self
                .members
                .iter()
                .filter(|(_, class)| *class == id)
                .map(|(pair, _)| *pair)
                .collect();
            pairs.sort_unstable();
            w.write_u16(*id).write_u16(pairs.len() as u16);
            for (family, subtype) in pairs {
                w.write_u16(family).write_u16(subtype);
            }
        }
        w
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn class_ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.classes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn class(&self, id: u16) -> Option<&RateClass> {
        self.classes.get(&id)
    }

    pub fn insert(&mut self, class: RateClass, pairs: &[(u16, u16)]) {
        for pair in pairs {
            self.members.insert(*pair, class.id);
        }
        self.classes.insert(class.id, class);
    }

    /// The class governing a sub-message; unlisted pairs fall into the
    /// lowest-numbered class.
    fn class_id_for(&self, family: u16, subtype: u16) -> Option<u16> {
        self.members
            .get(&(family, subtype))
            .copied()
            .filter(|id| self.classes.contains_key(id))
            .or_else(|| self.classes.keys().min().copied())
    }

    pub fn class_for(&self, family: u16, subtype: u16) -> Option<&RateClass> {
        self.class_id_for(family, subtype)
            .and_then(|id| self.classes.get(&id))
    }

    pub fn delay_for(&self, family: u16, subtype: u16, margin: u32, now: Instant) -> Duration {
        match self.class_for(family, subtype) {
            Some(class) => class.delay_to_reach(class.alert.saturating_add(margin), now),
            None => Duration::ZERO,
        }
    }

    pub fn record(&mut self, family: u16, subtype: u16, now: Instant) {
        if let Some(class) = self
            .class_id_for(family, subtype)
            .and_then(|id| self.classes.get_mut(&id))
        {
            class.record(now);
        }
    }

    /// Apply a rate change notice, returning its code and class id.
    pub fn apply_change(&mut self, body: &[u8]) -> Result<(RateChangeCode, u16), OscarError> {
        let mut r = ByteReader::new(body);
        let code = RateChangeCode::try_from(r.read_u16()?)?;
        let class = RateClass::read(&mut r)?;
        let id = class.id;
        match self.classes.get_mut(&id) {
            Some(existing) => existing.update_from(class),
            None => {
                self.classes.insert(id, class);
            }
        }
        Ok((code, id))
    }
}
