pub mod ahrs;
pub mod axes;
pub mod constants;
pub mod data_parser;
pub mod device_track;
pub mod dispatcher;
pub mod offset;
pub mod packets;
pub mod serial_packet;
pub mod utils;
