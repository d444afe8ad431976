use crate::property::PropertyValue;

/// Property values read back off a snapshot are already storage-domain
/// values; this exists so the commit path's old/new-value diffing can be
/// written uniformly regardless of which side a value came from.
pub(crate) fn convert_property_to_storage(value: PropertyValue) -> PropertyValue {
    value
}
