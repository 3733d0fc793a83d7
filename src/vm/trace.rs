use std::fmt;

/// Run-time conditions the VM itself raises.
/// User code may raise any code; these are the ones with a meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exception {
    Generic,
    DivByZero,
    NoIos,
    NoReturn,
    OutOfBounds,
    MapBounds,
    Eof,
    Map,
    Conversion,
    Elem,
    Constraint,
    Io,
}

impl Exception {
    const ALL: [Exception; 12] = [
        Exception::Generic,
        Exception::DivByZero,
        Exception::NoIos,
        Exception::NoReturn,
        Exception::OutOfBounds,
        Exception::MapBounds,
        Exception::Eof,
        Exception::Map,
        Exception::Conversion,
        Exception::Elem,
        Exception::Constraint,
        Exception::Io,
    ];

    /// The code handlers match against.
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Exception> {
        usize::try_from(code).ok().and_then(|i| Exception::ALL.get(i)).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Exception::Generic => "Error",
            Exception::DivByZero => "Division By Zero",
            Exception::NoIos => "No IO Space",
            Exception::NoReturn => "Missing Return",
            Exception::OutOfBounds => "Out Of Bounds",
            Exception::MapBounds => "Map Bounds",
            Exception::Eof => "End Of File",
            Exception::Map => "Map Error",
            Exception::Conversion => "Conversion Error",
            Exception::Elem => "Missing Element",
            Exception::Constraint => "Constraint Violation",
            Exception::Io => "IO Error",
        }
    }
}

/// Represents a runtime error, i.e. a traceback.
/// Raised conditions travel as traces until a handler takes them;
/// fatal traces mean the VM was handed a program it can not run,
/// and no handler ever takes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trace {
    code: i32,
    message: String,
    /// The closures unwound through, innermost first.
    notes: Vec<String>,
    fatal: bool,
}

impl Trace {
    pub fn error(exception: Exception, message: &str) -> Trace {
        Trace { code: exception.code(), message: message.to_string(), notes: vec![], fatal: false }
    }

    /// A condition raised by the program itself.
    pub fn raised(code: i32) -> Trace {
        let message = match Exception::from_code(code) {
            Some(exception) => format!("raised {}", exception.name()),
            None => format!("raised condition {}", code),
        };
        Trace { code, message, notes: vec![], fatal: false }
    }

    pub fn fatal(message: &str) -> Trace {
        Trace { code: Exception::Generic.code(), message: message.to_string(), notes: vec![], fatal: true }
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn exception(&self) -> Option<Exception> {
        Exception::from_code(self.code)
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    /// Whether a handler installed for `tag` takes this trace.
    /// Tag 0 takes everything that can be taken.
    pub fn caught_by(&self, tag: i32) -> bool {
        !self.fatal && (tag == Exception::Generic.code() || tag == self.code)
    }

    /// Records that the trace left a closure.
    pub fn unwind(mut self, note: &str) -> Trace {
        self.notes.push(note.to_string());
        self
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Traceback, most recent call last:")?;

        for note in self.notes.iter().rev() {
            writeln!(f, "  in {}", note)?;
        }

        let kind = match (self.fatal, self.exception()) {
            (true, _) => "Fatal Error",
            (false, Some(exception)) => exception.name(),
            (false, None) => "Error",
        };
        writeln!(f, "Runtime {}: {}", kind, self.message)
    }
}
