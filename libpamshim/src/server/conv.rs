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

use pamshim_protocol::{ConversationPrompt, ConversationReply, FramedStream, Request, Response};

/// One conversation prompt, stripped of any C ABI detail: a style code
/// and optional text, mirroring `pam_message`.
pub struct Prompt {
    pub style: libc::c_int,
    pub text: Option<String>,
}

/// One conversation reply, mirroring `pam_response`.
pub struct Reply {
    pub text: Option<String>,
    pub retcode: libc::c_int,
}

/// Does one conversation round-trip over the wire: sends a `CONVERSATION`
/// response built from the real library's prompt array, then blocks for
/// exactly one `AUTHENTICATE_RESPONSE` request.
///
/// Grounded on the original `conv_fn`: the client is expected to answer
/// with exactly as many replies as there were prompts. A mismatched count
/// is treated as a conversation failure, matching the real library's
/// contract that the conversation function reports errors through its own
/// return code.
pub fn converse_over_wire(
    to_client: &mut FramedStream,
    from_client: &mut FramedStream,
    prompts: Vec<Prompt>,
) -> Option<Vec<Reply>> {
    let expected = prompts.len();
    let wire_prompts: Vec<ConversationPrompt> =
        prompts.into_iter().map(|p| ConversationPrompt { style: p.style, text: p.text }).collect();

    if Response::Conversation { prompts: wire_prompts }.write(to_client).is_err() {
        return None;
    }

    let request = Request::read(from_client).ok()?;
    match request {
        Request::AuthenticateResponse { replies } if replies.len() == expected => {
            Some(replies.into_iter().map(reply_of).collect())
        }
        _ => None,
    }
}

fn reply_of(r: ConversationReply) -> Reply {
    Reply { text: r.text, retcode: r.retcode }
}
