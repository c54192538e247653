//! # 管理命令
//!
//! ## 意图（Why）
//! - 端口除了收发数据，还接受改变自身连接的命令：远端可以请求它新增或删除输出、
//!   踢掉某个输入、列出连接或描述自己；`Network::connect` 对远端端口即经由这条路径完成。
//!
//! ## 线上形态（What）
//! - 管理 bottle 以词汇开头：`help`、`ver`、`add <to> [carrier]`、`del <to>`、
//!   `del in <from>`、`list out`、`list in`、`desc`；
//! - 单字命令 `/`、`!`、`~`、`*` 把参数放在命令文本里，不带负载；
//! - 回复为 `[ok ...]` 或 `[fail "<code>" "<message>"]`，调用方据码值重建 `CoreError`。

use portwire_carriers::Frame;
use portwire_core::error::{CoreError, Result, codes};
use portwire_core::{Bottle, CommandKey, Contact, PortCommand, Value};
use tracing::{debug, info};

use crate::connection::{decode_bottle, dial, within};
use crate::delivery::encode_bottle;
use crate::network::{NetworkShared, no_connection};
use crate::port::Port;

const HELP: &[&str] = &[
    "help",
    "ver",
    "add <to> [carrier]",
    "del <to>",
    "del in <from>",
    "list out",
    "list in",
    "desc",
];

/// 一条已解析的管理请求。
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum AdminRequest {
    Help,
    Version,
    Add { to: String, carrier: Option<String> },
    Del(String),
    RemoveInput(String),
    ListOut,
    ListIn,
    Describe,
}

fn word(text: &str) -> Value {
    Value::vocab(text).unwrap_or_else(|_| Value::String(text.to_owned()))
}

fn bad_request(what: impl std::fmt::Display) -> CoreError {
    CoreError::protocol_violation(format!("bad admin request: {what}"))
}

impl AdminRequest {
    /// 从管理 bottle 解析。
    pub(crate) fn from_bottle(bottle: &Bottle) -> Result<Self> {
        let words: Vec<Option<String>> = bottle.values().iter().map(Value::as_word).collect();
        let arg = |index: usize| words.get(index).cloned().flatten();
        let Some(verb) = arg(0) else {
            return Err(bad_request("empty"));
        };
        let request = match verb.as_str() {
            "help" => AdminRequest::Help,
            "ver" => AdminRequest::Version,
            "add" => AdminRequest::Add {
                to: arg(1).ok_or_else(|| bad_request("add needs a target"))?,
                carrier: arg(2),
            },
            "del" => match (arg(1), arg(2)) {
                (Some(direction), Some(from)) if direction == "in" => AdminRequest::RemoveInput(from),
                (Some(to), _) => AdminRequest::Del(to),
                (None, _) => return Err(bad_request("del needs a target")),
            },
            "list" => match arg(1).as_deref() {
                Some("out") => AdminRequest::ListOut,
                Some("in") => AdminRequest::ListIn,
                other => return Err(bad_request(format!("list {}", other.unwrap_or("")))),
            },
            "*" | "desc" => AdminRequest::Describe,
            other => return Err(bad_request(other)),
        };
        Ok(request)
    }

    /// 从单字命令解析。
    pub(crate) fn from_command(command: &PortCommand) -> Result<Self> {
        let target = || {
            let text = command.text().trim();
            if text.is_empty() {
                Err(bad_request(format!("`{command}` needs a target")))
            } else {
                Ok(text.to_owned())
            }
        };
        match command.key() {
            CommandKey::AddOutput => Ok(AdminRequest::Add {
                to: target()?,
                carrier: None,
            }),
            CommandKey::RemoveOutput => Ok(AdminRequest::Del(target()?)),
            CommandKey::RemoveInput => Ok(AdminRequest::RemoveInput(target()?)),
            CommandKey::Describe => Ok(AdminRequest::Describe),
            _ => Err(bad_request(command)),
        }
    }

    /// 编码为管理 bottle。
    pub(crate) fn to_bottle(&self) -> Bottle {
        let mut bottle = Bottle::new();
        match self {
            AdminRequest::Help => {
                bottle.push(word("help"));
            }
            AdminRequest::Version => {
                bottle.push(word("ver"));
            }
            AdminRequest::Add { to, carrier } => {
                bottle.push(word("add")).push(to.as_str());
                if let Some(carrier) = carrier {
                    bottle.push(carrier.as_str());
                }
            }
            AdminRequest::Del(to) => {
                bottle.push(word("del")).push(to.as_str());
            }
            AdminRequest::RemoveInput(from) => {
                bottle.push(word("del")).push(word("in")).push(from.as_str());
            }
            AdminRequest::ListOut => {
                bottle.push(word("list")).push(word("out"));
            }
            AdminRequest::ListIn => {
                bottle.push(word("list")).push(word("in"));
            }
            AdminRequest::Describe => {
                bottle.push(word("*"));
            }
        }
        bottle
    }
}

/// 在本地端口上执行请求，返回 `ok` 之后的回复内容。
pub(crate) async fn execute(port: &Port, request: AdminRequest) -> Result<Bottle> {
    debug!(port = port.name(), ?request, "admin request");
    let mut reply = Bottle::new();
    match request {
        AdminRequest::Help => {
            reply.push(HELP.iter().map(|line| Value::from(*line)).collect::<Bottle>());
        }
        AdminRequest::Version => {
            reply.push("portwire").push(env!("CARGO_PKG_VERSION"));
        }
        AdminRequest::Add { to, carrier } => {
            let route = port.add_output(&to, carrier.as_deref()).await?;
            info!(%route, "output added on request");
            reply.push(route.to_string());
        }
        AdminRequest::Del(to) => {
            if !port.remove_output(&to).await {
                return Err(no_connection(port.name(), &to));
            }
            reply.push(to);
        }
        AdminRequest::RemoveInput(from) => {
            if !port.remove_input(&from) {
                return Err(no_connection(&from, port.name()));
            }
            reply.push(from);
        }
        AdminRequest::ListOut => {
            for route in port.outputs() {
                reply.push(route.to_name().to_owned());
            }
        }
        AdminRequest::ListIn => {
            for route in port.inputs() {
                reply.push(route.from_name().to_owned());
            }
        }
        AdminRequest::Describe => {
            let routes = |routes: Vec<portwire_core::Route>| -> Bottle {
                routes.iter().map(|route| Value::from(route.to_string())).collect()
            };
            reply
                .push(port.contact().to_string())
                .push(routes(port.outputs()))
                .push(routes(port.inputs()));
        }
    }
    Ok(reply)
}

/// 把执行结果包装为线上回复。
pub(crate) fn reply_bottle(result: Result<Bottle>) -> Bottle {
    match result {
        Ok(body) => {
            let mut reply = Bottle::new().with(word("ok"));
            for value in body.into_values() {
                reply.push(value);
            }
            reply
        }
        Err(err) => Bottle::new()
            .with(word("fail"))
            .with(err.code())
            .with(err.message().to_owned()),
    }
}

/// 解读远端回复。
pub(crate) fn interpret(reply: Bottle) -> Result<Bottle> {
    let mut values = reply.into_values().into_iter();
    match values.next().as_ref().and_then(Value::as_word).as_deref() {
        Some("ok") => Ok(values.collect()),
        Some("fail") => {
            let code = values.next().and_then(|value| value.as_word()).unwrap_or_default();
            let message = values.next().and_then(|value| value.as_word()).unwrap_or_default();
            Err(CoreError::new(
                codes::intern(&code).unwrap_or(codes::PROTOCOL_VIOLATION),
                message,
            ))
        }
        _ => Err(CoreError::protocol_violation("admin reply lacks a status word")),
    }
}

/// 向远端端口发送一条管理请求并等待回复。
///
/// # 逻辑（How）
/// - 总是经 `tcp` 载体以匿名身份连接，发送请求、读取回复后发送退出命令；
/// - 等待上限取 `reply_timeout`，未配置时取 `connect_timeout`。
pub(crate) async fn remote(
    shared: &NetworkShared,
    contact: &Contact,
    request: &AdminRequest,
) -> Result<Bottle> {
    let factory = shared.registry.lookup("tcp")?;
    let mut session = dial(shared, factory.as_ref(), contact, "").await?;
    let text_mode = session.carrier.capabilities().text_mode;
    let frame = Frame::new(
        PortCommand::admin(),
        encode_bottle(&request.to_bottle(), text_mode)?,
    );
    let limit = shared
        .config
        .reply_timeout()
        .unwrap_or_else(|| shared.config.connect_timeout());

    let reply = within(Some(limit), codes::REPLY_TIMEOUT, "admin reply", async {
        session.carrier.write(session.stream.as_mut(), &frame).await?;
        session
            .carrier
            .expect_response(session.stream.as_mut(), true)
            .await
    })
    .await;
    if reply.is_ok() {
        let quit = Frame::command_only(PortCommand::quit());
        if let Err(err) = session.carrier.write(session.stream.as_mut(), &quit).await {
            debug!(%contact, error = %err, "quit not delivered");
        }
    }
    let _ = session.stream.shutdown().await;

    let blocks = reply?.unwrap_or_default();
    interpret(decode_bottle(&blocks, text_mode)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_bottles_parse_both_ways() {
        let requests = [
            AdminRequest::Help,
            AdminRequest::Version,
            AdminRequest::Add {
                to: "/receiver".to_owned(),
                carrier: Some("text".to_owned()),
            },
            AdminRequest::Del("/receiver".to_owned()),
            AdminRequest::RemoveInput("/sender".to_owned()),
            AdminRequest::ListOut,
            AdminRequest::ListIn,
            AdminRequest::Describe,
        ];
        for request in requests {
            let parsed = AdminRequest::from_bottle(&request.to_bottle()).expect("可解析");
            assert_eq!(parsed, request);
        }
    }

    #[test]
    fn single_key_commands() {
        let add = PortCommand::new(CommandKey::AddOutput, "/receiver");
        assert_eq!(
            AdminRequest::from_command(&add).expect("新增输出"),
            AdminRequest::Add {
                to: "/receiver".to_owned(),
                carrier: None
            }
        );
        let kick = PortCommand::new(CommandKey::RemoveInput, "/sender");
        assert_eq!(
            AdminRequest::from_command(&kick).expect("删除输入"),
            AdminRequest::RemoveInput("/sender".to_owned())
        );
        assert!(AdminRequest::from_command(&PortCommand::new(CommandKey::AddOutput, "")).is_err());
    }

    #[test]
    fn failures_keep_their_code() {
        let reply = reply_bottle(Err(CoreError::name_not_found("/ghost")));
        let err = interpret(reply).expect_err("失败回复");
        assert_eq!(err.code(), codes::NAME_NOT_FOUND);
        assert!(err.message().contains("/ghost"));

        let ok = interpret(reply_bottle(Ok(Bottle::new().with(1)))).expect("成功回复");
        assert_eq!(ok.get(0).and_then(Value::as_i64), Some(1));
    }

    #[test]
    fn unknown_verbs_are_violations() {
        let err = AdminRequest::from_bottle(&Bottle::new().with(word("zap"))).expect_err("未知命令");
        assert_eq!(err.code(), codes::PROTOCOL_VIOLATION);
    }
}
