//! Message dispatch
//!
//! Resolves a message name against a receiver's linearization, honoring
//! visibility and explicit ancestor qualification. A miss is a value, not an
//! error: unqualified searches fall back to a default handler, and qualified
//! failures return [`Resolution::NotFound`] for the interpreter to turn into
//! whatever language-level condition it chooses.

use crate::linearize::{linearization, LinearizeError};
use crate::program::{ClassId, ClassResolver, HandlerId, Program, Visibility};

/// Separator between an explicit ancestor qualifier and the plain name.
pub const QUALIFIER: char = '.';

/// Outcome of a message resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// A named handler matched.
    Handler(HandlerId),
    /// No name matched; a default handler along the linearization applies.
    Default(HandlerId),
    /// Nothing applicable.
    NotFound,
}

/// Resolve `message` sent to an instance of `receiver` from code in `caller`.
///
/// A name containing [`QUALIFIER`] is a qualified send: the prefix names an
/// explicit ancestor class whose own handler table is searched, bypassing
/// normal override resolution.
pub fn resolve(
    program: &Program,
    resolver: &impl ClassResolver,
    receiver: ClassId,
    caller: ClassId,
    message: &str,
) -> Result<Resolution, LinearizeError> {
    match message.rsplit_once(QUALIFIER) {
        Some((target_name, plain)) => {
            resolve_qualified(program, resolver, receiver, caller, target_name, plain)
        }
        None => resolve_unqualified(program, resolver, receiver, caller, message),
    }
}

fn resolve_qualified(
    program: &Program,
    resolver: &impl ClassResolver,
    receiver: ClassId,
    caller: ClassId,
    target_name: &str,
    plain: &str,
) -> Result<Resolution, LinearizeError> {
    let Some(target) = resolver.resolve_class(caller, target_name) else {
        return Ok(Resolution::NotFound);
    };
    let receiver_lin = linearization(program, resolver, receiver)?;
    let caller_lin = linearization(program, resolver, caller)?;
    // The receiver must extend-or-equal the caller, and the named target
    // must be an ancestor of the caller.
    if !receiver_lin.contains(&caller) || !caller_lin.contains(&target) {
        return Ok(Resolution::NotFound);
    }
    // Only the target's own table; no default-handler fallback.
    match program.class(target).handler_named(plain) {
        Some(handler) if visible(program, target, caller, caller_lin, handler) => {
            Ok(Resolution::Handler(handler))
        }
        _ => Ok(Resolution::NotFound),
    }
}

fn resolve_unqualified(
    program: &Program,
    resolver: &impl ClassResolver,
    receiver: ClassId,
    caller: ClassId,
    message: &str,
) -> Result<Resolution, LinearizeError> {
    let receiver_lin = linearization(program, resolver, receiver)?;
    let caller_lin = linearization(program, resolver, caller)?;

    // First match in linearization order wins; that is what realizes
    // overriding. Handlers the caller may not see are skipped, not errors.
    for &owner in receiver_lin {
        if let Some(handler) = program.class(owner).handler_named(message) {
            if visible(program, owner, caller, caller_lin, handler) {
                return Ok(Resolution::Handler(handler));
            }
        }
    }

    // The walk exhausted: fall back to the first default handler along the
    // receiver's linearization, the receiver's own first.
    for &owner in receiver_lin {
        if let Some(default) = program.class(owner).default_handler {
            return Ok(Resolution::Default(default));
        }
    }
    Ok(Resolution::NotFound)
}

fn visible(
    program: &Program,
    owner: ClassId,
    caller: ClassId,
    caller_lin: &[ClassId],
    handler: HandlerId,
) -> bool {
    match program.handler(handler).visibility {
        Visibility::Public => true,
        Visibility::Protected => caller_lin.contains(&owner),
        Visibility::Private => caller == owner,
        // Reserved for the anonymous default slot; unmatchable by name.
        Visibility::None => false,
    }
}
