// Timestamp handling for the FAT family
// FAT stores MS-DOS date/time words; exFAT packs both into one 32-bit
// field and adds a 10 ms increment and a UTC offset byte.

use std::fmt;

use chrono::{Datelike, Duration, Local, NaiveDate, NaiveDateTime, Offset, Timelike};

// Bit positions inside the packed fields.
const DOS_DAY: u32 = 0;
const DOS_MONTH: u32 = 5;
const DOS_YEAR: u32 = 9;
const DOS_MINUTE: u32 = 5;
const DOS_HOUR: u32 = 11;
const EXFAT_MINUTE: u32 = 5;
const EXFAT_HOUR: u32 = 11;
const EXFAT_DAY: u32 = 16;
const EXFAT_MONTH: u32 = 21;
const EXFAT_YEAR: u32 = 25;

/// The exFAT UTC offset byte is meaningful only when this bit is set.
pub const TZ_VALID: u8 = 0x80;

/// Broken-down time as stored on disk (2-second resolution, year base
/// 1980).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timestamp {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

impl Timestamp {
    fn from_naive(t: NaiveDateTime) -> Self {
        Self {
            year: t.year() as u16,
            month: t.month() as u8,
            day: t.day() as u8,
            hour: t.hour() as u8,
            minute: t.minute() as u8,
            second: t.second() as u8,
        }
    }

    fn to_naive(self) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(self.year as i32, self.month as u32, self.day as u32)?
            .and_hms_opt(self.hour as u32, self.minute as u32, self.second as u32)
    }

    /// Shift by a UTC offset in minutes; zeroed or malformed fields are
    /// left untouched.
    fn shifted(self, minutes: i32) -> Self {
        match self.to_naive() {
            Some(t) => Self::from_naive(t + Duration::minutes(minutes as i64)),
            None => self,
        }
    }
}

/// Decode a DOS date/time pair. `tenth` counts 10 ms units (0..199)
/// and contributes the odd second.
pub fn dos_to_timestamp(date: u16, time: u16, tenth: u8) -> Timestamp {
    Timestamp {
        year: 1980 + ((date >> DOS_YEAR) & 0x7F),
        month: ((date >> DOS_MONTH) & 0x0F) as u8,
        day: (date & 0x1F) as u8,
        hour: ((time >> DOS_HOUR) & 0x1F) as u8,
        minute: ((time >> DOS_MINUTE) & 0x3F) as u8,
        second: ((time & 0x1F) * 2) as u8 + tenth / 100,
    }
}

/// Encode a broken-down time as a DOS date/time pair plus the 10 ms
/// remainder.
pub fn timestamp_to_dos(t: Timestamp) -> (u16, u16, u8) {
    let date = ((t.year.saturating_sub(1980) & 0x7F) << DOS_YEAR)
        | ((t.month as u16 & 0x0F) << DOS_MONTH)
        | (t.day as u16 & 0x1F);
    let time = ((t.hour as u16 & 0x1F) << DOS_HOUR)
        | ((t.minute as u16 & 0x3F) << DOS_MINUTE)
        | (t.second as u16 / 2);
    let tenth = (t.second % 2) * 100;
    (date, time, tenth)
}

/// Decode an exFAT packed timestamp. When the offset byte's validity
/// bit is set, the stored offset is applied to yield wall-clock time.
pub fn exfat_to_timestamp(packed: u32, subsec: u8, tz: u8) -> Timestamp {
    let t = Timestamp {
        year: 1980 + ((packed >> EXFAT_YEAR) & 0x7F) as u16,
        month: ((packed >> EXFAT_MONTH) & 0x0F) as u8,
        day: ((packed >> EXFAT_DAY) & 0x1F) as u8,
        hour: ((packed >> EXFAT_HOUR) & 0x1F) as u8,
        minute: ((packed >> EXFAT_MINUTE) & 0x3F) as u8,
        second: ((packed & 0x1F) * 2) as u8 + subsec / 100,
    };
    if tz & TZ_VALID != 0 {
        t.shifted(utc_offset_minutes(tz))
    } else {
        t
    }
}

/// Encode a broken-down time into the exFAT packed form plus the 10 ms
/// remainder.
pub fn timestamp_to_exfat(t: Timestamp) -> (u32, u8) {
    let packed = (((t.year.saturating_sub(1980) as u32) & 0x7F) << EXFAT_YEAR)
        | ((t.month as u32 & 0x0F) << EXFAT_MONTH)
        | ((t.day as u32 & 0x1F) << EXFAT_DAY)
        | ((t.hour as u32 & 0x1F) << EXFAT_HOUR)
        | ((t.minute as u32 & 0x3F) << EXFAT_MINUTE)
        | (t.second as u32 / 2);
    let subsec = (t.second % 2) * 100;
    (packed, subsec)
}

/// Offset in minutes encoded by an exFAT UTC offset byte: 15-minute
/// units in 7-bit two's complement, gated by the validity bit.
pub fn utc_offset_minutes(tz: u8) -> i32 {
    if tz & TZ_VALID == 0 {
        return 0;
    }
    let mut units = (tz & 0x7F) as i32;
    if units & 0x40 != 0 {
        units -= 0x80;
    }
    units * 15
}

/// Encode a minute offset into the 7-bit unit field (validity bit not
/// included).
pub fn minutes_to_utc_offset(minutes: i32) -> u8 {
    ((minutes / 15) & 0x7F) as u8
}

/// Current time in UTC plus the host's UTC offset byte, for stamping
/// fresh directory entries.
pub fn now_utc() -> (Timestamp, u8) {
    let now = Local::now();
    let offset_minutes = now.offset().fix().local_minus_utc() / 60;
    (
        Timestamp::from_naive(now.naive_utc()),
        minutes_to_utc_offset(offset_minutes),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dos_round_trip() {
        let t = Timestamp {
            year: 2024,
            month: 1,
            day: 15,
            hour: 14,
            minute: 30,
            second: 10,
        };
        let (date, time, tenth) = timestamp_to_dos(t);
        assert_eq!(dos_to_timestamp(date, time, tenth), t);
    }

    #[test]
    fn odd_seconds_survive_via_tenth() {
        let t = Timestamp {
            year: 2021,
            month: 6,
            day: 3,
            hour: 1,
            minute: 2,
            second: 3,
        };
        let (date, time, tenth) = timestamp_to_dos(t);
        assert_eq!(tenth, 100);
        assert_eq!(dos_to_timestamp(date, time, tenth), t);
    }

    #[test]
    fn exfat_round_trip() {
        let t = Timestamp {
            year: 2023,
            month: 12,
            day: 31,
            hour: 23,
            minute: 59,
            second: 58,
        };
        let (packed, subsec) = timestamp_to_exfat(t);
        assert_eq!(exfat_to_timestamp(packed, subsec, 0), t);
    }

    #[test]
    fn utc_offset_decoding() {
        // +09:00 is 36 quarter hours.
        assert_eq!(utc_offset_minutes(0x80 | 36), 540);
        // -05:00 is -20 quarter hours, two's complement in 7 bits.
        assert_eq!(utc_offset_minutes(0x80 | (0x80 - 20)), -300);
        // Invalid bit unset: no offset.
        assert_eq!(utc_offset_minutes(36), 0);
    }

    #[test]
    fn offset_applied_when_valid() {
        let t = Timestamp {
            year: 2022,
            month: 3,
            day: 1,
            hour: 0,
            minute: 30,
            second: 0,
        };
        let (packed, subsec) = timestamp_to_exfat(t);
        let shifted = exfat_to_timestamp(packed, subsec, 0x80 | 4); // +01:00
        assert_eq!(shifted.hour, 1);
        assert_eq!(shifted.minute, 30);
    }

    #[test]
    fn offset_encoding_round_trip() {
        assert_eq!(utc_offset_minutes(TZ_VALID | minutes_to_utc_offset(540)), 540);
        assert_eq!(
            utc_offset_minutes(TZ_VALID | minutes_to_utc_offset(-300)),
            -300
        );
    }
}
