#![forbid(unsafe_code)]

mod descriptor;
mod filters;
mod progressor;
mod token;
mod value;

pub use descriptor::{
    IndexCapability, IndexDescriptor, IndexOrder, IndexQueryConstraints, PropertyPredicate,
};
pub use filters::{
    ChainPlan, ExactMatchPolicy, SecurityPolicy, ValueInjectorPolicy,
};
pub use progressor::{
    AcceptPolicy, EmptyProgressor, EntityValueClient, FilterClient, FilteredProgressor,
    IndexProgressor, IndexSeekClient,
};
pub use token::{EmptyEntityStream, EntityStream, TokenIndex, TokenStream};
pub use value::{KeyRange, ValueIndex, ValueKey, ValueProgressor};
