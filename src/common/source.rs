use std::{
    path::{Path, PathBuf},
    rc::Rc,
};

/// `Source` is the text a program was parsed from, paired with a name.
/// The compiler never reads sources itself; they are handed over
/// by the parser together with the AST, and only kept around so
/// that errors can point back into the text.
#[derive(Debug, PartialEq, Eq)]
pub struct Source {
    pub contents: String,
    pub path: PathBuf,
}

impl Source {
    /// Creates a new `Source` from its text and the path it came from.
    pub fn new(contents: &str, path: &Path) -> Rc<Source> {
        Rc::new(Source {
            contents: contents.to_string(),
            path: path.to_owned(),
        })
    }

    /// A `Source` that did not come from a file, e.g. a command line.
    /// Such sources are named `./source`.
    pub fn source(contents: &str) -> Rc<Source> {
        Source::new(contents, &PathBuf::from("./source"))
    }
}
