//! 端点地址模型：[`Contact`] 与 [`Route`]。
//!
//! 名字要么为空（匿名端点），要么以 `/` 开头；其余形式在构造时即被拒绝，
//! 避免错误名字流入名字存储。

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result, codes};

/// 校验端点名字。
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('/') {
        Ok(())
    } else {
        Err(CoreError::new(
            codes::NAME_INVALID,
            format!("port name `{name}` must be empty or start with `/`"),
        ))
    }
}

/// 已解析的端点地址。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 名字解析的唯一产物：告诉连接方“去哪里、用什么载体”；
/// - 构造后不可变，多个连接可共享同一份拷贝。
///
/// ## 契约 (What)
/// - `name`：为空或以 `/` 开头；
/// - `host`/`port`：套接字地址，`port == 0` 表示尚未绑定；
/// - `carrier`：偏好的载体名，空串表示交由调用方决定。
///
/// ## 注意事项 (Trade-offs)
/// - `local` 载体不建立套接字连接，但仍以 `host:port` 作为进程内登记的键。
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contact {
    name: String,
    host: String,
    port: u16,
    carrier: String,
}

impl Contact {
    /// 构造带名字的完整地址。
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        carrier: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            name,
            host: host.into(),
            port,
            carrier: carrier.into(),
        })
    }

    /// 仅含名字、尚待解析的地址。
    pub fn by_name(name: impl Into<String>) -> Result<Self> {
        Self::new(name, "", 0, "")
    }

    /// 匿名套接字地址。
    pub fn socket(host: impl Into<String>, port: u16, carrier: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            host: host.into(),
            port,
            carrier: carrier.into(),
        }
    }

    /// 解析字面地址。
    ///
    /// 接受 `/name`、`host:port` 与 `carrier://host:port[/name]` 三种形式。
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() || text.starts_with('/') {
            return Self::by_name(text);
        }
        let (carrier, rest) = match text.split_once("://") {
            Some((carrier, rest)) => (carrier, rest),
            None => ("", text),
        };
        let (endpoint, name) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };
        let (host, port) = endpoint.rsplit_once(':').ok_or_else(|| {
            CoreError::new(codes::NAME_INVALID, format!("contact `{text}` lacks a port"))
        })?;
        let port = port.parse::<u16>().map_err(|err| {
            CoreError::new(codes::NAME_INVALID, format!("contact `{text}` has bad port"))
                .with_cause(err)
        })?;
        Self::new(name, host, port, carrier)
    }

    /// 获取名字。
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 获取主机。
    pub fn host(&self) -> &str {
        &self.host
    }

    /// 获取端口号。
    pub fn port(&self) -> u16 {
        self.port
    }

    /// 获取载体名。
    pub fn carrier(&self) -> &str {
        &self.carrier
    }

    /// 是否匿名。
    pub fn is_anonymous(&self) -> bool {
        self.name.is_empty()
    }

    /// 是否带有可连接的套接字地址。
    pub fn has_socket(&self) -> bool {
        !self.host.is_empty() && self.port != 0
    }

    /// `host:port` 形式，供套接字连接使用。
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// 替换载体名。
    pub fn with_carrier(mut self, carrier: impl Into<String>) -> Self {
        self.carrier = carrier.into();
        self
    }

    /// 替换名字。
    pub fn with_name(mut self, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        self.name = name;
        Ok(self)
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.has_socket() {
            return f.write_str(&self.name);
        }
        if !self.carrier.is_empty() {
            write!(f, "{}://", self.carrier)?;
        }
        write!(f, "{}:{}{}", self.host, self.port, self.name)
    }
}

/// 一条逻辑连接的两端与所用载体。
///
/// 打印形式为 `from->carrier->to`，用于日志、事件与重连。
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Route {
    from: String,
    to: String,
    carrier: String,
}

impl Route {
    pub fn new(from: impl Into<String>, to: impl Into<String>, carrier: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            carrier: carrier.into(),
        }
    }

    pub fn from_name(&self) -> &str {
        &self.from
    }

    pub fn to_name(&self) -> &str {
        &self.to
    }

    pub fn carrier(&self) -> &str {
        &self.carrier
    }

    /// 两端都有名字时视为具名路由，失败后保留以便重连。
    pub fn is_named(&self) -> bool {
        !self.from.is_empty() && !self.to.is_empty()
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = from.into();
        self
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = to.into();
        self
    }

    pub fn with_carrier(mut self, carrier: impl Into<String>) -> Self {
        self.carrier = carrier.into();
        self
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}->{}", self.from, self.carrier, self.to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn names_must_be_rooted() {
        assert!(Contact::by_name("/foo").is_ok());
        assert!(Contact::by_name("").is_ok());
        let err = Contact::by_name("foo").expect_err("未以 / 开头的名字应被拒绝");
        assert_eq!(err.code(), codes::NAME_INVALID);
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn parse_literal_forms() {
        let c = Contact::parse("tcp://127.0.0.1:10002/recv").expect("完整字面地址");
        assert_eq!(c.carrier(), "tcp");
        assert_eq!(c.host(), "127.0.0.1");
        assert_eq!(c.port(), 10002);
        assert_eq!(c.name(), "/recv");

        let c = Contact::parse("localhost:99").expect("host:port");
        assert!(c.is_anonymous());
        assert_eq!(c.socket_address(), "localhost:99");

        let c = Contact::parse("/only/name").expect("纯名字");
        assert!(!c.has_socket());

        assert!(Contact::parse("nohost").is_err());
        assert!(Contact::parse("h:notaport").is_err());
    }

    #[test]
    fn display_round_trips_through_parse() {
        let c = Contact::new("/a", "10.0.0.1", 5000, "udp").expect("合法地址");
        assert_eq!(c.to_string(), "udp://10.0.0.1:5000/a");
        assert_eq!(Contact::parse(&c.to_string()).expect("再次解析"), c);
    }

    #[test]
    fn route_display_and_naming() {
        let route = Route::new("/sender", "/receiver", "tcp");
        assert_eq!(route.to_string(), "/sender->tcp->/receiver");
        assert!(route.is_named());
        assert!(!route.clone().with_from("").is_named());
    }
}
