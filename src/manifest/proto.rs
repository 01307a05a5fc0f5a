//! Binary manifest message read by the device at activation time.

use prost::Message;
use serde::Deserialize;

#[derive(Clone, PartialEq, Message, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApexManifest {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(int64, tag = "2")]
    pub version: i64,
    #[prost(string, tag = "3")]
    pub pre_install_hook: String,
    #[prost(string, tag = "4")]
    pub post_install_hook: String,
    #[prost(string, tag = "5")]
    pub version_name: String,
    #[prost(bool, tag = "6")]
    pub no_code: bool,
    #[prost(string, repeated, tag = "7")]
    pub provide_native_libs: Vec<String>,
    #[prost(string, repeated, tag = "8")]
    pub require_native_libs: Vec<String>,
    #[prost(string, repeated, tag = "9")]
    pub jni_libs: Vec<String>,
    #[prost(string, repeated, tag = "10")]
    pub require_shared_apex_libs: Vec<String>,
    #[prost(string, repeated, tag = "11")]
    pub provide_shared_apex_libs: Vec<String>,
    #[prost(bool, tag = "12")]
    pub supports_rebootless_update: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_numbers_on_the_wire() {
        let m = ApexManifest {
            name: "a".into(),
            version: 1,
            jni_libs: vec!["libj.so".into()],
            ..Default::default()
        };
        let bytes = m.encode_to_vec();
        // tag 1 (len-delimited), tag 2 (varint), tag 9 (len-delimited)
        assert_eq!(&bytes[..3], &[0x0a, 0x01, b'a']);
        assert_eq!(&bytes[3..5], &[0x10, 0x01]);
        assert_eq!(bytes[5], 0x4a);
        assert_eq!(ApexManifest::decode(bytes.as_slice()).unwrap(), m);
    }
}
