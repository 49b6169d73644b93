pub mod convert;
pub mod glyphs;
pub mod hmac_utils;
