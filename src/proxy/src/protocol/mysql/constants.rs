use strum_macros::AsRefStr;

// see: https://dev.mysql.com/doc/refman/8.0/en/identifier-length.html
// max packet payload length.
pub const MAX_PAYLOAD_LEN: usize = 16_777_215;

pub const ERR_TEXT_LEN: usize = 80;

pub const MAX_KEY_PARTS: usize = 16;

pub const MAX_ALIAS_IDENTIFIER_LEN: usize = 256;

pub const PACKET_HEADER_LEN: usize = 4;
/// auth-plugin-data-part-1 The first 8 bits of a random number will be used for subsequent password encryption.
/// 1 byte padding. 2-byte integer.
pub const AUTH_PLUGIN_DATA_PART_1_LENGTH: usize = 8;
/// The length of the random number required for encryption. (auth-plugin-data-part-1 + auth-plugin-data-part-2)
pub const SCRAMBLE_SIZE: usize = 20;

#[derive(Debug, PartialEq, AsRefStr)]
pub enum AuthPluginName {
    #[strum(serialize = "mysql_old_password")]
    AuthMySQlOldPassword,
    #[strum(serialize = "caching_sha2_password")]
    AuthCachingSha2Password,
    #[strum(serialize = "sha256_password")]
    AuthSha256Password,
    #[strum(serialize = "mysql_native_password")]
    AuthNativePassword,
    #[strum(serialize = "auth_unknown_plugin")]
    UnKnowPluginName,
}

#[derive(Debug, PartialEq)]
#[repr(u8)]
pub enum HeaderInfo {
    OKHeader = 0x00,
    ErrHeader = 0xff,
    EOFHeader = 0xfe,
    LocalInFileHeader = 0xfb,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum CommandCode {
    ComSleep = 0,
    ComQuit,
    ComInitDB,
    ComQuery,
    ComFieldList,
    ComCreateDB,
    ComDropDB,
    ComRefresh,
    ComShutdown,
    ComStatistics,
    ComProcessInfo,
    ComConnect,
    ComProcessKill,
    ComDebug,
    ComPing,
    ComTime,
    ComDelayedInsert,
    ComChangeUser,
    ComBinlogDump,
    ComTableDump,
    ComConnectOut,
    ComRegisterSlave,
    ComStmtPrepare,
    ComStmtExecute,
    ComStmtSendLongData,
    ComStmtClose,
    ComStmtReset,
    ComSetOption,
    ComStmtFetch,
    ComDaemon,
    ComBinlogDumpGtid,
    ComResetConnection,
    ComEnd,
}

/// Human-readable command name, used by the decoder tool when rendering
/// audit records (the command byte alone isn't worth much in a report).
pub fn command_name(code: u8) -> &'static str {
    match code {
        0 => "COM_SLEEP",
        1 => "COM_QUIT",
        2 => "COM_INIT_DB",
        3 => "COM_QUERY",
        4 => "COM_FIELD_LIST",
        5 => "COM_CREATE_DB",
        6 => "COM_DROP_DB",
        7 => "COM_REFRESH",
        8 => "COM_SHUTDOWN",
        9 => "COM_STATISTICS",
        10 => "COM_PROCESS_INFO",
        11 => "COM_CONNECT",
        12 => "COM_PROCESS_KILL",
        13 => "COM_DEBUG",
        14 => "COM_PING",
        15 => "COM_TIME",
        16 => "COM_DELAYED_INSERT",
        17 => "COM_CHANGE_USER",
        18 => "COM_BINLOG_DUMP",
        19 => "COM_TABLE_DUMP",
        20 => "COM_CONNECT_OUT",
        21 => "COM_REGISTER_SLAVE",
        22 => "COM_STMT_PREPARE",
        23 => "COM_STMT_EXECUTE",
        24 => "COM_STMT_SEND_LONG_DATA",
        25 => "COM_STMT_CLOSE",
        26 => "COM_STMT_RESET",
        27 => "COM_SET_OPTION",
        28 => "COM_STMT_FETCH",
        29 => "COM_DAEMON",
        30 => "COM_BINLOG_DUMP_GTID",
        31 => "COM_RESET_CONNECTION",
        _ => "COM_UNKNOWN",
    }
}

#[cfg(test)]
mod test {
    use crate::protocol::mysql::constants::*;
    #[allow(unused_imports)]
    use bitflags::Flags;

    #[test]
    pub fn max_packet_size_test() {
        let max_u24_size = 16_777_215;
        assert_eq!(max_u24_size, MAX_PAYLOAD_LEN);
    }

    #[test]
    pub fn column_flag_test() {
        let enum_flag = mysql_common::constants::ColumnFlags::NOT_NULL_FLAG.bits();
        assert_eq!(1_u16, enum_flag);
    }

    #[test]
    pub fn test_common_info_code() {
        let com_info = CommandCode::ComQuery as u8;
        println!("ComQueryCode = {com_info}");
    }
}
