//! Operator input on stdin. Plain lines go out as broadcast channel messages; lines starting
//! with `/` are commands.

use anyhow::{anyhow, bail};
use manet_core::{Address, Payload};

use crate::dispatcher::Control;

pub const HELP: &str = "/peers | /forget <address> | /enable <address> | /disable <address>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Say(String),
    Peers,
    Forget(Address),
    Enable(Address, bool),
}

impl Command {
    /// `Ok(None)` for blank lines.
    pub fn parse(line: &str) -> anyhow::Result<Option<Command>> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Ok(None);
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Some(Command::Say(line.to_string())));
        };
        let mut words = rest.split_whitespace();
        let verb = words.next().unwrap_or_default();
        let mut address = || -> anyhow::Result<Address> {
            let arg = words
                .next()
                .ok_or_else(|| anyhow!("/{verb} needs an address"))?;
            Ok(arg.parse()?)
        };
        let cmd = match verb {
            "peers" => Command::Peers,
            "forget" => Command::Forget(address()?),
            "enable" => Command::Enable(address()?, true),
            "disable" => Command::Enable(address()?, false),
            other => bail!("unknown command /{other} ({HELP})"),
        };
        Ok(Some(cmd))
    }

    pub fn into_control(self) -> Control {
        match self {
            Command::Say(text) => Control::Send {
                destination: Address::BROADCAST,
                payload: Payload::ChannelBytes {
                    channel: None,
                    data: text.into_bytes(),
                },
            },
            Command::Peers => Control::Peers,
            Command::Forget(address) => Control::Forget(address),
            Command::Enable(address, enabled) => Control::SetEnabled { address, enabled },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_a_message() {
        assert_eq!(
            Command::parse("hello team\n").unwrap(),
            Some(Command::Say("hello team".into()))
        );
        assert_eq!(Command::parse("   ").unwrap(), None);
    }

    #[test]
    fn commands_take_addresses() {
        assert_eq!(Command::parse("/peers").unwrap(), Some(Command::Peers));
        assert_eq!(
            Command::parse("/forget 20").unwrap(),
            Some(Command::Forget(Address(20)))
        );
        assert_eq!(
            Command::parse("/disable 7").unwrap(),
            Some(Command::Enable(Address(7), false))
        );
        assert!(Command::parse("/forget").is_err());
        assert!(Command::parse("/enable broadcastish").is_err());
        assert!(Command::parse("/reboot").is_err());
    }

    #[test]
    fn enable_maps_to_control() {
        match Command::Enable(Address(9), true).into_control() {
            Control::SetEnabled { address, enabled } => {
                assert_eq!(address, Address(9));
                assert!(enabled);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
