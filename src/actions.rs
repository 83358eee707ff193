//! ACK frame actions: SET-VAR and UNSET-VAR, the only two action types
//! SPOP defines.

use crate::codec::{encode_kv, encode_string, Value};
use bytes::{BufMut, BytesMut};

const ACTION_TYPE_SET_VAR: u8 = 1;
const ACTION_TYPE_UNSET_VAR: u8 = 2;

/// The variable scope an action applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Process = 0,
    Session = 1,
    Transaction = 2,
    Request = 3,
    Response = 4,
}

/// An action an agent returns in response to a NOTIFY message.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    SetVar {
        name: String,
        scope: Scope,
        value: Value,
    },
    UnsetVar {
        name: String,
        scope: Scope,
    },
}

impl Action {
    /// Encode this action, appending to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Action::SetVar { name, scope, value } => {
                buf.put_u8(ACTION_TYPE_SET_VAR);
                buf.put_u8(3); // nb-args: scope, name, value
                buf.put_u8(*scope as u8);
                encode_kv(buf, name, value);
            }
            Action::UnsetVar { name, scope } => {
                buf.put_u8(ACTION_TYPE_UNSET_VAR);
                buf.put_u8(2); // nb-args: scope, name
                buf.put_u8(*scope as u8);
                encode_string(buf, name);
            }
        }
    }
}

/// Encode a full list of actions, appending to `buf` as placed in an ACK
/// frame's payload. Lets callers supply a pool-backed buffer instead of
/// allocating fresh.
pub fn encode_actions_into(buf: &mut BytesMut, actions: &[Action]) {
    for action in actions {
        action.encode(buf);
    }
}

/// Encode a full list of actions into a freshly allocated buffer.
pub fn encode_actions(actions: &[Action]) -> BytesMut {
    let mut buf = BytesMut::new();
    encode_actions_into(&mut buf, actions);
    buf
}
