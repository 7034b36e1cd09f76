// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A small command line tool that drives a pam-shim client session
//! directly, for manual and integration testing against a real PAM stack.
//! Not part of the shim's protocol surface.

use std::{
    io::{self, BufRead, Write},
    mem,
    sync::Arc,
};

use anyhow::{anyhow, Context};
use clap::Parser;
use libpamshim::{
    client::{Conversation, Session},
    consts::{PAM_ERROR_MSG, PAM_PROMPT_ECHO_OFF, PAM_PROMPT_ECHO_ON, PAM_SUCCESS, PAM_TEXT_INFO},
    ShimConfig,
};
use pamshim_protocol::{ConversationPrompt, ConversationReply};

#[derive(Parser, Debug)]
#[clap(author, about = "Drive a pam-shim session from a terminal")]
struct Args {
    #[clap(help = "The user to authenticate")]
    user: String,

    #[clap(default_value = "login", help = "The PAM service name to use")]
    service: String,

    #[clap(long, help = "Override the PAM confdir for this session")]
    confdir: Option<String>,
}

/// Answers conversation prompts by reading from the controlling terminal,
/// disabling echo for password-style prompts. Grounded on the reference
/// test harness's `pam_conv_func`.
struct TerminalConversation;

impl Conversation for TerminalConversation {
    fn converse(
        &self,
        prompts: &[ConversationPrompt],
    ) -> Result<Vec<ConversationReply>, libc::c_int> {
        let mut replies = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            let reply = match prompt.style {
                PAM_PROMPT_ECHO_OFF => {
                    let text = read_line(prompt.text.as_deref().unwrap_or("Password: "), false)
                        .map_err(|_| libpamshim::consts::PAM_CONV_ERR)?;
                    ConversationReply { text: Some(text), retcode: 0 }
                }
                PAM_PROMPT_ECHO_ON => {
                    let text = read_line(prompt.text.as_deref().unwrap_or("Input: "), true)
                        .map_err(|_| libpamshim::consts::PAM_CONV_ERR)?;
                    ConversationReply { text: Some(text), retcode: 0 }
                }
                PAM_ERROR_MSG => {
                    if let Some(text) = &prompt.text {
                        eprintln!("{text}");
                    }
                    ConversationReply { text: None, retcode: 0 }
                }
                PAM_TEXT_INFO => {
                    if let Some(text) = &prompt.text {
                        println!("{text}");
                    }
                    ConversationReply { text: None, retcode: 0 }
                }
                _ => return Err(libpamshim::consts::PAM_CONV_ERR),
            };
            replies.push(reply);
        }
        Ok(replies)
    }
}

/// Reads one line from standard input, toggling terminal echo off for the
/// duration of the read when `echo` is false and stdin is a tty.
fn read_line(prompt: &str, echo: bool) -> anyhow::Result<String> {
    print!("{prompt}");
    io::stdout().flush().ok();

    let fd = libc::STDIN_FILENO;
    let is_tty = unsafe { libc::isatty(fd) } != 0;
    let mut saved: libc::termios = unsafe { mem::zeroed() };
    let mut toggled = false;

    if !echo && is_tty {
        if unsafe { libc::tcgetattr(fd, &mut saved) } == 0 {
            let mut raw = saved;
            raw.c_lflag &= !libc::ECHO;
            toggled = unsafe { libc::tcsetattr(fd, libc::TCSAFLUSH, &raw) } == 0;
        }
    }

    let mut line = String::new();
    let result = io::stdin().lock().read_line(&mut line);

    if toggled {
        unsafe { libc::tcsetattr(fd, libc::TCSAFLUSH, &saved) };
        println!();
    }

    result.context("reading from stdin")?;
    if line.ends_with('\n') {
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
    }
    Ok(line)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = ShimConfig::from_env();
    libpamshim::init_subscriber(&config);

    let conv: Arc<dyn Conversation> = Arc::new(TerminalConversation);
    let mut session = Session::start(&config, &args.service, &args.user, args.confdir.as_deref(), conv)
        .map_err(|status| anyhow!("pam_start failed (code {status})"))?;

    let auth_status = session.authenticate(0);
    if auth_status == PAM_SUCCESS {
        println!("authentication succeeded for user '{}' (service '{}')", args.user, args.service);
    } else {
        eprintln!(
            "authentication failed for user '{}' (service '{}'), code {auth_status}",
            args.user, args.service
        );
    }

    let end_status = session.end(auth_status);
    if end_status != PAM_SUCCESS {
        eprintln!("pam_end returned code {end_status}");
    }

    if auth_status != PAM_SUCCESS {
        std::process::exit(1);
    }
    Ok(())
}
