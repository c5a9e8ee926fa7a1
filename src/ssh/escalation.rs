//! 提权包装
//!
//! 把普通命令改写为以 root 身份运行的命令字符串。执行器只关心"是否需要提权"，
//! 具体机制由 [`EscalationPolicy`] 决定。
//!
//! 转义规则只有一条：`su` 方式下把命令中的 `"` 替换为 `\"` 后嵌入双引号参数。
//! 反斜杠、`$`、反引号不做转义，包含这些字符的命令在 `su` 方式下可能被远端 shell
//! 二次展开，调用方需要自行处理。

use std::borrow::Cow;

use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};

/// 提权方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EscalationMethod {
    /// 直接在命令前加 `sudo`
    #[default]
    Command,
    /// 通过 `sudo su root -c "..."` 在 root shell 中运行整条命令
    Su,
}

impl std::str::FromStr for EscalationMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "command" | "direct-command-prefix" => Ok(Self::Command),
            "su" | "switch-user-via-shell" => Ok(Self::Su),
            _ => Err(format!("Unknown sudo method: {}", s)),
        }
    }
}

/// 提权策略，会话创建时从配置读入，之后只读
#[derive(Debug, Clone, Default)]
pub struct EscalationPolicy {
    /// 是否启用提权
    pub enabled: bool,
    /// 提权方式
    pub method: EscalationMethod,
    /// sudo 密码（None 表示远端已配置 NOPASSWD）
    pub credential: Option<Secret<String>>,
}

impl EscalationPolicy {
    pub fn new(method: EscalationMethod) -> Self {
        Self {
            enabled: true,
            method,
            credential: None,
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(Secret::new(credential.into()));
        self
    }
}

/// 按策略包装命令（不检查 `enabled`）
pub fn wrap(command: &str, policy: &EscalationPolicy) -> String {
    let credential = policy.credential.as_ref().map(|c| c.expose_secret().as_str());

    match policy.method {
        EscalationMethod::Su => {
            let escaped = command.replace('"', "\\\"");
            match credential {
                Some(password) => {
                    format!("echo \"{}\" | sudo -S su root -c \"{}\"", password, escaped)
                }
                None => format!("sudo su root -c \"{}\"", escaped),
            }
        }
        EscalationMethod::Command => match credential {
            Some(password) => format!("echo \"{}\" | sudo -S {}", password, command),
            None => format!("sudo {}", command),
        },
    }
}

/// 仅在调用方要求提权且策略启用时包装，否则原样返回
pub fn apply<'a>(
    command: &'a str,
    policy: &EscalationPolicy,
    needs_escalation: bool,
) -> Cow<'a, str> {
    if needs_escalation && policy.enabled {
        Cow::Owned(wrap(command, policy))
    } else {
        Cow::Borrowed(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_su_without_credential_escapes_quotes() {
        let policy = EscalationPolicy::new(EscalationMethod::Su);
        assert_eq!(wrap(r#"echo "hi""#, &policy), r#"sudo su root -c "echo \"hi\"""#);
    }

    #[test]
    fn test_su_with_credential_pipes_password() {
        let policy = EscalationPolicy::new(EscalationMethod::Su).with_credential("pw");
        let wrapped = wrap(r#"echo "hi""#, &policy);

        assert_eq!(wrapped, r#"echo "pw" | sudo -S su root -c "echo \"hi\"""#);
        assert!(wrapped.contains(r#"echo "pw""#));
        assert!(wrapped.contains(r#"| sudo -S su root -c "echo \"hi\"""#));
    }

    #[test]
    fn test_command_prefix() {
        let policy = EscalationPolicy::new(EscalationMethod::Command);
        assert_eq!(wrap("insmod x.ko", &policy), "sudo insmod x.ko");

        let policy = policy.with_credential("pw");
        assert_eq!(wrap("insmod x.ko", &policy), r#"echo "pw" | sudo -S insmod x.ko"#);
    }

    #[test]
    fn test_command_prefix_does_not_escape() {
        let policy = EscalationPolicy::new(EscalationMethod::Command);
        assert_eq!(wrap(r#"echo "hi""#, &policy), r#"sudo echo "hi""#);
    }

    #[test]
    fn test_su_leaves_dollar_and_backslash_untouched() {
        let policy = EscalationPolicy::new(EscalationMethod::Su);
        assert_eq!(
            wrap(r"echo $HOME \n", &policy),
            r#"sudo su root -c "echo $HOME \n""#
        );
    }

    #[test]
    fn test_apply_passthrough() {
        let disabled = EscalationPolicy::disabled();
        assert!(matches!(apply("lsmod", &disabled, true), Cow::Borrowed("lsmod")));

        let enabled = EscalationPolicy::new(EscalationMethod::Command);
        assert!(matches!(apply("lsmod", &enabled, false), Cow::Borrowed("lsmod")));
        assert_eq!(apply("lsmod", &enabled, true), "sudo lsmod");
    }

    #[test]
    fn test_method_from_str() {
        assert_eq!("command".parse::<EscalationMethod>().unwrap(), EscalationMethod::Command);
        assert_eq!("SU".parse::<EscalationMethod>().unwrap(), EscalationMethod::Su);
        assert_eq!(
            "switch-user-via-shell".parse::<EscalationMethod>().unwrap(),
            EscalationMethod::Su
        );
        assert!("doas".parse::<EscalationMethod>().is_err());
    }
}
