//! Subset of MySQL server error codes and their SQLSTATE values, used when
//! writing ERR packets back to a connected client. See
//! <https://dev.mysql.com/doc/mysql-errors/8.0/en/server-error-reference.html>.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
#[allow(non_camel_case_types)]
pub enum ErrorKind {
    ER_ACCESS_DENIED_ERROR = 1045,
    ER_ACCESS_DENIED_NO_PASSWORD_ERROR = 1698,
    ER_DBACCESS_DENIED_ERROR = 1044,
    ER_PARSE_ERROR = 1064,
    ER_UNKNOWN_COM_ERROR = 1047,
    ER_NOT_SUPPORTED_YET = 1235,
    ER_BAD_FIELD_ERROR = 1054,
    ER_DUP_ENTRY = 1062,
    ER_NO_SUCH_TABLE = 1146,
    ER_INTERNAL_ERROR = 1815,
    ER_CON_COUNT_ERROR = 1040,
    ER_HOST_NOT_PRIVILEGED = 1130,
    ER_BAD_DB_ERROR = 1049,
}

impl ErrorKind {
    pub fn sqlstate(&self) -> &'static [u8] {
        match self {
            ErrorKind::ER_ACCESS_DENIED_ERROR => b"28000",
            ErrorKind::ER_ACCESS_DENIED_NO_PASSWORD_ERROR => b"28000",
            ErrorKind::ER_DBACCESS_DENIED_ERROR => b"42000",
            ErrorKind::ER_PARSE_ERROR => b"42000",
            ErrorKind::ER_UNKNOWN_COM_ERROR => b"08S01",
            ErrorKind::ER_NOT_SUPPORTED_YET => b"42000",
            ErrorKind::ER_BAD_FIELD_ERROR => b"42S22",
            ErrorKind::ER_DUP_ENTRY => b"23000",
            ErrorKind::ER_NO_SUCH_TABLE => b"42S02",
            ErrorKind::ER_INTERNAL_ERROR => b"HY000",
            ErrorKind::ER_CON_COUNT_ERROR => b"08004",
            ErrorKind::ER_HOST_NOT_PRIVILEGED => b"42000",
            ErrorKind::ER_BAD_DB_ERROR => b"42000",
        }
    }
}
