//! Bottle 编解码性质验证
//!
//! # 教案级注释概览
//!
//! - **核心目标 (Why)**：任意字段序列经写入器编码、再经读取器解码后必须逐位还原；
//!   再次编码得到的字节与首次完全一致（重编码幂等）。
//! - **设计手法 (How)**：用 proptest 递归生成嵌套 bottle，分别走二进制与文本两种语法。
//!   文本语法无法区分整数宽度与单双精度，因此文本性质只使用其规范子集（`Int32`、超出
//!   `i32` 的 `Int64`、`Float64`、字符串、词汇、二进制块与列表）。
//! - **契约 (What)**：浮点只取有限值；NaN 不满足自反相等，不纳入性质。

use bytes::Bytes;
use portwire_core::wire::{ConnectionReader, ConnectionWriter, Portable};
use portwire_core::{Bottle, Value};
use proptest::prelude::*;

fn vocab_strategy() -> impl Strategy<Value = Value> {
    "[a-z]{1,4}".prop_map(|word| Value::vocab(&word).expect("四字符以内的词汇"))
}

fn binary_leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i8>().prop_map(Value::Int8),
        any::<i16>().prop_map(Value::Int16),
        any::<i32>().prop_map(Value::Int32),
        any::<i64>().prop_map(Value::Int64),
        proptest::num::f32::NORMAL.prop_map(Value::Float32),
        proptest::num::f64::NORMAL.prop_map(Value::Float64),
        ".{0,12}".prop_map(Value::String),
        proptest::collection::vec(any::<u8>(), 0..24).prop_map(|b| Value::Blob(Bytes::from(b))),
        vocab_strategy(),
    ]
}

fn text_leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i32>().prop_map(Value::Int32),
        prop_oneof![i64::MIN..(i32::MIN as i64), (i32::MAX as i64 + 1)..i64::MAX]
            .prop_map(Value::Int64),
        proptest::num::f64::NORMAL.prop_map(Value::Float64),
        "[ -~]{0,12}".prop_map(Value::String),
        proptest::collection::vec(any::<u8>(), 0..24).prop_map(|b| Value::Blob(Bytes::from(b))),
        vocab_strategy(),
    ]
}

fn bottle_of(leaf: BoxedStrategy<Value>) -> impl Strategy<Value = Bottle> {
    let value = leaf.prop_recursive(3, 32, 6, |inner| {
        proptest::collection::vec(inner, 0..6).prop_map(|items| Value::List(Bottle::from_values(items)))
    });
    proptest::collection::vec(value, 0..8).prop_map(Bottle::from_values)
}

proptest! {
    #[test]
    fn prop_binary_round_trip_is_bit_exact(bottle in bottle_of(binary_leaf().boxed())) {
        let mut writer = ConnectionWriter::binary();
        bottle.write(&mut writer).expect("写入不会失败");
        let blocks = writer.into_blocks();

        let mut reader = ConnectionReader::from_blocks(&blocks, false);
        let mut decoded = Bottle::new();
        decoded.read(&mut reader).expect("合法负载可解码");
        prop_assert_eq!(&decoded, &bottle);
        prop_assert!(reader.is_empty(), "解码必须恰好消费全部负载");
        prop_assert_eq!(decoded.to_binary(), bottle.to_binary());
    }

    #[test]
    fn prop_text_round_trip(bottle in bottle_of(text_leaf().boxed())) {
        let mut writer = ConnectionWriter::text();
        bottle.write(&mut writer).expect("写入不会失败");
        let mut reader = ConnectionReader::from_blocks(&writer.into_blocks(), true);
        let mut decoded = Bottle::new();
        decoded.read(&mut reader).expect("合法文本可解码");
        prop_assert_eq!(&decoded, &bottle);
        prop_assert_eq!(decoded.to_text(), bottle.to_text());
    }

    #[test]
    fn prop_truncation_never_panics(bottle in bottle_of(binary_leaf().boxed()), cut in 0usize..64) {
        let bytes = bottle.to_binary();
        let cut = cut.min(bytes.len());
        let truncated = bytes.slice(..bytes.len() - cut);
        let result = Bottle::from_binary(truncated);
        if cut > 0 {
            prop_assert!(result.is_err(), "截断后的负载必须被拒绝");
        } else {
            prop_assert_eq!(result.expect("未截断"), bottle);
        }
    }
}

#[test]
fn testing_one_round_trips_in_both_syntaxes() {
    let bottle = Bottle::new().with("testing").with(1);
    assert_eq!(Bottle::from_binary(bottle.to_binary()).expect("二进制"), bottle);
    assert_eq!(Bottle::from_text(&bottle.to_text()).expect("文本"), bottle);
}
