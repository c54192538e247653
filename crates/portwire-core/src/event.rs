//! 连接生命周期事件。

use std::fmt;

use crate::contact::Route;

/// 事件种类。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PortInfoKind {
    /// 占位事件，不携带连接信息。
    Null,
    /// 输入连接建立或拆除。
    Incoming,
    /// 输出连接建立或拆除。
    Outgoing,
    /// 其他通知，例如已建立连接上的异步错误。
    Misc,
}

/// 投递给观察者的事件记录。
///
/// `created` 区分建立（`true`）与拆除（`false`），对 `Misc` 无意义。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortInfo {
    pub kind: PortInfoKind,
    pub created: bool,
    pub route: Route,
    pub message: String,
}

impl PortInfo {
    pub fn incoming(route: Route, created: bool) -> Self {
        let message = describe(&route, created, "input");
        Self {
            kind: PortInfoKind::Incoming,
            created,
            route,
            message,
        }
    }

    pub fn outgoing(route: Route, created: bool) -> Self {
        let message = describe(&route, created, "output");
        Self {
            kind: PortInfoKind::Outgoing,
            created,
            route,
            message,
        }
    }

    pub fn misc(route: Route, message: impl Into<String>) -> Self {
        Self {
            kind: PortInfoKind::Misc,
            created: false,
            route,
            message: message.into(),
        }
    }
}

impl Default for PortInfo {
    fn default() -> Self {
        Self {
            kind: PortInfoKind::Null,
            created: false,
            route: Route::new("", "", ""),
            message: String::new(),
        }
    }
}

impl fmt::Display for PortInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

fn describe(route: &Route, created: bool, direction: &str) -> String {
    let verb = if created { "added" } else { "removed" };
    format!("{verb} {direction} connection {route}")
}
