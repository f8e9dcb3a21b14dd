#[macro_use]
pub mod pub_macros {

    /// Macro to create the GPT partition type constants and their lookup
    /// table.
    macro_rules! partition_types {
        (
            $(
                $(#[$docs:meta])*
                ($upcase:ident, $guid:expr, $os:expr, $name:expr)$(,)*
            )+
        ) => {
            const fn str_to_uuid_or_panic(s: &str) -> Uuid {
                match Uuid::try_parse(s) {
                    Ok(u) => u,
                    Err(_) => panic!("string was not an uuid"),
                }
            }
            $(
                $(#[$docs])*
                pub const $upcase: Type = Type {
                    guid: str_to_uuid_or_panic($guid),
                    os: $os,
                    name: $name,
                };
            )+

            /// Every GPT partition type known to the registry, in table order.
            pub const GPT_TYPES: &[Type] = &[$($upcase),+];

            impl FromStr for Type {
                type Err = String;
                fn from_str(s: &str) -> Result<Self, Self::Err> {
                    match s {
                        $(
                            $name |
                            $guid |
                            stringify!($upcase) => Ok($upcase),
                        )+
                        _ => {
                            if let Some(t) = GPT_TYPES
                                .iter()
                                .find(|t| t.name.eq_ignore_ascii_case(s))
                            {
                                return Ok(*t);
                            }
                            match ::uuid::Uuid::from_str(s) {
                                Ok(u) => Ok(Type::from(u)),
                                Err(_) => Err(format!("unknown partition type {s:?}")),
                            }
                        }
                    }
                }
            }
            impl From<Uuid> for Type {
                fn from(guid: Uuid) -> Self {
                    $(
                        if guid == $upcase.guid {
                            return $upcase;
                        }
                    )+
                    Type {
                        guid,
                        os: OperatingSystem::None,
                        name: "",
                    }
                }
            }
        }
    }
}

pub(crate) trait ResultInsert<T> {
    fn insert_ok(&mut self, value: T) -> &mut T;
}

impl<T, E> ResultInsert<T> for Result<T, E> {
    fn insert_ok(&mut self, value: T) -> &mut T {
        *self = Ok(value);

        match self {
            Ok(v) => v,
            Err(_) => unreachable!("just stored an Ok value"),
        }
    }
}
