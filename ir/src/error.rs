use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// A node body referenced a placeholder variable the caller did not bind.
    #[snafu(display("unbound placeholder variable {name} in index expression"))]
    UnboundPlaceholder { name: String },
}
