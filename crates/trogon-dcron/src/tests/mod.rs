mod builders;

pub(crate) use builders::*;
