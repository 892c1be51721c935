pub mod packet_constants {
    /// Total size of one wire packet in bytes. Fixed for the whole link.
    pub const PACKET_SIZE: usize = 128;
    /// Size of the packet type field in bytes.
    pub const TYPE_SIZE: usize = core::mem::size_of::<u32>();
    /// Size of the CRC field in bytes.
    pub const CRC_SIZE: usize = core::mem::size_of::<u32>();
    /// Size of the magic tail in bytes.
    pub const MAGIC_SIZE: usize = core::mem::size_of::<u64>();
    /// Size of the opaque payload carried by every packet.
    pub const INNER_SIZE: usize = PACKET_SIZE - TYPE_SIZE - CRC_SIZE - MAGIC_SIZE;
    /// Tail marker written after every packet. This is the natural (host) order value, the wire
    /// carries it little-endian.
    pub const MAGIC: u64 = 0xDEAD_BEEF_8008_5069;
    /// What the framer's rolling big-endian accumulator holds once the magic tail has arrived.
    pub const MAGIC_REVERSED: u64 = MAGIC.swap_bytes();

    pub const TYPE_OFFSET: usize = 0;
    pub const INNER_OFFSET: usize = TYPE_OFFSET + TYPE_SIZE;
    pub const CRC_OFFSET: usize = INNER_OFFSET + INNER_SIZE;
    pub const MAGIC_OFFSET: usize = CRC_OFFSET + CRC_SIZE;

    const _: () = assert!(MAGIC_OFFSET + MAGIC_SIZE == PACKET_SIZE);
}

pub mod packet_type_ids {
    pub const NONE: u32 = 0;
    pub const ACCEL: u32 = 1;
    pub const RAW_ACCEL: u32 = 2;
    pub const TEXT: u32 = 3;
    pub const CONFIGURE: u32 = 4;
}

pub mod payload_constants {
    use super::packet_constants::INNER_SIZE;

    /// Number of physical sensor units multiplexed into one raw batch.
    pub const DEVICE_COUNT: usize = 4;
    /// Bytes used by one raw sub-sample: delta (4) + accel (12) + gyro (12).
    pub const RAW_SAMPLE_SIZE: usize = 4 + 3 * 4 + 3 * 4;
    /// Bytes used by an accel sample before padding.
    pub const ACCEL_SAMPLE_USED_SIZE: usize = 8 + 3 * 4 + 4 * 4 + 3 * 4;
    /// Header of a text fragment: length (4) + has_next (1).
    pub const TEXT_HEADER_SIZE: usize = 4 + 1;
    /// Maximum number of string bytes in one text fragment.
    pub const TEXT_CAPACITY: usize = INNER_SIZE - TEXT_HEADER_SIZE;
    /// Header of a configure packet: kind (4) + value (4).
    pub const CONFIGURE_HEADER_SIZE: usize = 4 + 4;
    /// Bytes available for structured configure data.
    pub const CONFIGURE_DATA_SIZE: usize = INNER_SIZE - CONFIGURE_HEADER_SIZE;
    /// Bytes used by the settings snapshot inside configure data.
    pub const SETTINGS_SIZE: usize = 1 + 1 + 2 + 2 * DEVICE_COUNT * 3 * 4;

    const _: () = assert!(RAW_SAMPLE_SIZE * DEVICE_COUNT == INNER_SIZE);
    const _: () = assert!(ACCEL_SAMPLE_USED_SIZE <= INNER_SIZE);
    const _: () = assert!(SETTINGS_SIZE <= CONFIGURE_DATA_SIZE);
}

pub mod configure_ids {
    pub mod kind {
        pub const NONE: u32 = 0;
        pub const POLL_FOR_DATA: u32 = 1;
        pub const BACKLIGHT: u32 = 2;
        pub const RESET: u32 = 3;
    }

    pub mod value {
        pub const NONE: u32 = 0;
        pub const ACK: u32 = 1;
        pub const BACKLIGHT_SET_TOGGLE: u32 = 2;
        pub const BACKLIGHT_SET_ON: u32 = 3;
        pub const BACKLIGHT_SET_OFF: u32 = 4;
        pub const BACKLIGHT_QUERY: u32 = 5;
        pub const BACKLIGHT_IS_ON: u32 = 6;
        pub const BACKLIGHT_IS_OFF: u32 = 7;
        pub const RESET_RESULT_SETTINGS: u32 = 8;
    }
}

pub mod sample_constants {
    /// Standard gravity in m/s².
    pub const GRAVITY_METERS_PER_SECONDS_SQUARED: f32 = 9.80665;
    /// Samples whose delta exceeds this are considered stale (1/50th of a second).
    pub const MAX_SAMPLE_DELTA_MICROS: u64 = 1_000_000 / 100 * 2;
    /// Rate the firmware produces raw batches at.
    pub const DEFAULT_SAMPLE_RATE_HZ: u32 = 100;
}
