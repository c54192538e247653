//! 前导嗅探的性质测试。
//!
//! - 每个内建载体写出的前导都被且只被它自己认领；
//! - 任意 8 字节要么被恰好一个载体认领，要么得到握手失败，结果与调用次数无关。

use portwire_carriers::CarrierRegistry;
use portwire_carriers::framing::{TEXT_ACK_PREAMBLE, TEXT_PREAMBLE, specifier, yarp_preamble};
use portwire_core::ErrorKind;
use proptest::prelude::*;

#[test]
fn builtin_preambles_map_back_to_their_carrier() {
    let registry = CarrierRegistry::with_defaults();
    let cases = [
        (yarp_preamble(specifier::TCP), "tcp"),
        (yarp_preamble(specifier::TCP | specifier::NO_ACK), "fast_tcp"),
        (*TEXT_PREAMBLE, "text"),
        (*TEXT_ACK_PREAMBLE, "text_ack"),
        (yarp_preamble(specifier::UDP), "udp"),
        (yarp_preamble(specifier::MCAST), "mcast"),
        (yarp_preamble(specifier::LOCAL), "local"),
    ];
    for (header, name) in cases {
        assert_eq!(registry.sniff(&header).expect("内建前导").name(), name);
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 512, .. ProptestConfig::default() })]

    #[test]
    fn sniff_is_deterministic(header in any::<[u8; 8]>()) {
        let registry = CarrierRegistry::with_defaults();
        let first = registry.sniff(&header).map(|factory| factory.name().to_owned());
        let second = registry.sniff(&header).map(|factory| factory.name().to_owned());
        match (first, second) {
            (Ok(a), Ok(b)) => prop_assert_eq!(a, b),
            (Err(a), Err(b)) => {
                prop_assert_eq!(a.kind(), ErrorKind::HandshakeFailed);
                prop_assert_eq!(a.code(), b.code());
            }
            _ => prop_assert!(false, "sniff 结果不稳定"),
        }
    }

    #[test]
    fn at_most_one_builtin_claims_a_header(header in any::<[u8; 8]>()) {
        let registry = CarrierRegistry::with_defaults();
        let claims = registry
            .names()
            .iter()
            .filter(|name| {
                registry
                    .lookup(name)
                    .map(|factory| factory.check_header(&header))
                    .unwrap_or(false)
            })
            .count();
        prop_assert!(claims <= 1);
    }

    #[test]
    fn yarp_specifiers_round_trip(spec in 0i32..256) {
        let header = yarp_preamble(spec);
        prop_assert_eq!(portwire_carriers::framing::parse_yarp_preamble(&header), Some(spec));
    }
}
