//! # stream 模块说明
//!
//! ## 意图（Why）
//! - 载体只关心“读满 N 个字节”“整体写出一组片段”，不关心底层是 TCP、UDP 还是进程内管道；
//!   [`TwoWayStream`] 把三者收敛成同一接口，载体实现因此与传输解耦。
//!
//! ## 契约（What）
//! - [`TwoWayStream::send`] 把多个片段作为一个单元写出并刷新：流式通道保证顺序且不交错，
//!   数据报通道把它们拼成一个数据报；
//! - [`TwoWayStream::read_exact`] 读满缓冲区，对端关闭时返回 `ErrorKind::Closed`；
//! - [`TwoWayStream::shutdown`] 幂等，多次调用不会报错。

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use portwire_core::error::{CoreError, Result, codes};

/// 双向字节通道。
#[async_trait]
pub trait TwoWayStream: Send + Sync + fmt::Debug {
    /// 本端地址；进程内管道返回 `None`。
    fn local_addr(&self) -> Option<SocketAddr>;

    /// 对端地址；进程内管道返回 `None`。
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// 读满 `buf`。
    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;

    /// 整体写出 `parts` 并刷新。
    async fn send(&mut self, parts: &[&[u8]]) -> Result<()>;

    /// 关闭写方向并释放底层资源。
    async fn shutdown(&mut self) -> Result<()>;

    /// 开始读取一个新单元。数据报通道借此丢弃上一个数据报的残余字节。
    fn begin_packet(&mut self) {}

    /// 是否为数据报通道。
    fn is_datagram(&self) -> bool {
        false
    }
}

/// 装箱后的通道，连接与载体之间以此传递所有权。
pub type BoxStream = Box<dyn TwoWayStream>;

/// 读取一个小端 `i32`。
pub async fn read_i32_le(stream: &mut (dyn TwoWayStream + '_)) -> Result<i32> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await?;
    Ok(i32::from_le_bytes(buf))
}

/// 逐字节读取一行，去掉结尾的 `\n` 与 `\r`。
///
/// 超过 `max_len` 仍未见到换行视为协议违规，防止对端用超长行耗尽内存。
pub async fn read_line(stream: &mut (dyn TwoWayStream + '_), max_len: usize) -> Result<String> {
    let mut line = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await?;
        match byte[0] {
            b'\n' => break,
            other => {
                if line.len() >= max_len {
                    return Err(CoreError::violation(
                        codes::WIRE_TOO_LARGE,
                        format!("text line exceeds {max_len} bytes"),
                    ));
                }
                line.push(other);
            }
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line).map_err(|err| {
        CoreError::violation(codes::WIRE_MALFORMED, "text line is not utf-8").with_cause(err)
    })
}
