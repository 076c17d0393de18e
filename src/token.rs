/// Associates readiness events with the descriptor that produced them.
///
/// `Token` is a wrapper around `usize` and is used as an argument to
/// backend registration. When the backend reports readiness it includes
/// the token the descriptor was registered with, which lets the dispatcher
/// map the event back to its watch entry. The loop registers each
/// descriptor under `Token(fd as usize)`.
///
/// # Examples
///
/// ```
/// use coio::Token;
///
/// let token = Token(7);
/// assert_eq!(usize::from(token), 7);
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub usize);

impl From<Token> for usize {
    fn from(val: Token) -> usize {
        val.0
    }
}

impl From<usize> for Token {
    fn from(val: usize) -> Token {
        Token(val)
    }
}
